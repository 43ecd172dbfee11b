use crate::config::types::{RunError, Submission};
use crate::judge::languages::c::PROGRAM;
use crate::judge::runner::{in_box, tool, LanguageRunner};

#[derive(Debug, Clone, Default)]
pub struct CppRunner;

impl LanguageRunner for CppRunner {
    fn language(&self) -> &'static str {
        "cpp"
    }

    fn aliases(&self) -> &'static [&'static str] {
        &["c++", "cc", "cxx"]
    }

    fn staged_name(&self, _submission: &Submission) -> String {
        "main.cpp".to_string()
    }

    fn compile_command(&self, staged: &str) -> Result<Option<Vec<String>>, RunError> {
        Ok(Some(vec![
            tool("g++")?,
            "-std=c++17".to_string(),
            "-O2".to_string(),
            "-pipe".to_string(),
            "-o".to_string(),
            in_box(PROGRAM),
            in_box(staged),
        ]))
    }

    fn launch_command(&self, _staged: &str, args: &[String]) -> Result<Vec<String>, RunError> {
        let mut argv = vec![in_box(PROGRAM)];
        argv.extend(args.iter().cloned());
        Ok(argv)
    }
}
