use crate::config::types::RunError;
use crate::judge::languages::{
    c::CRunner, cpp::CppRunner, java::JavaRunner, native::NativeRunner, python::PythonRunner,
};
use crate::judge::runner::LanguageRunner;
use std::sync::Arc;

/// Language tag to runner lookup. Adding a language means adding a runner here.
#[derive(Clone)]
pub struct RunnerRegistry {
    runners: Vec<Arc<dyn LanguageRunner>>,
}

impl RunnerRegistry {
    pub fn empty() -> Self {
        Self {
            runners: Vec::new(),
        }
    }

    pub fn register(&mut self, runner: Arc<dyn LanguageRunner>) {
        self.runners.push(runner);
    }

    pub fn get(&self, language: &str) -> Result<Arc<dyn LanguageRunner>, RunError> {
        let tag = language.trim().to_ascii_lowercase();
        self.runners
            .iter()
            .find(|r| r.language() == tag || r.aliases().contains(&tag.as_str()))
            .cloned()
            .ok_or_else(|| {
                RunError::InvalidSubmission(format!(
                    "unsupported language '{}' (known: {})",
                    language,
                    self.languages().join(", ")
                ))
            })
    }

    pub fn languages(&self) -> Vec<&'static str> {
        self.runners.iter().map(|r| r.language()).collect()
    }
}

impl Default for RunnerRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(Arc::new(CRunner));
        registry.register(Arc::new(CppRunner));
        registry.register(Arc::new(PythonRunner));
        registry.register(Arc::new(JavaRunner));
        registry.register(Arc::new(NativeRunner));
        registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_tags_and_aliases() {
        let registry = RunnerRegistry::default();
        assert_eq!(registry.get("c").unwrap().language(), "c");
        assert_eq!(registry.get("C++").unwrap().language(), "cpp");
        assert_eq!(registry.get("py").unwrap().language(), "python");
        assert_eq!(registry.get("exe").unwrap().language(), "native");
        assert!(matches!(
            registry.get("cobol"),
            Err(RunError::InvalidSubmission(_))
        ));
    }
}
