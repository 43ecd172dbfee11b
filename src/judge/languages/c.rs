use crate::config::types::{RunError, Submission};
use crate::judge::runner::{in_box, tool, LanguageRunner};

/// Output binary of the C and C++ builds
pub const PROGRAM: &str = "program";

#[derive(Debug, Clone, Default)]
pub struct CRunner;

impl LanguageRunner for CRunner {
    fn language(&self) -> &'static str {
        "c"
    }

    fn staged_name(&self, _submission: &Submission) -> String {
        "main.c".to_string()
    }

    fn compile_command(&self, staged: &str) -> Result<Option<Vec<String>>, RunError> {
        Ok(Some(vec![
            tool("gcc")?,
            "-std=gnu11".to_string(),
            "-O2".to_string(),
            "-pipe".to_string(),
            "-o".to_string(),
            in_box(PROGRAM),
            in_box(staged),
            "-lm".to_string(),
        ]))
    }

    fn launch_command(&self, _staged: &str, args: &[String]) -> Result<Vec<String>, RunError> {
        let mut argv = vec![in_box(PROGRAM)];
        argv.extend(args.iter().cloned());
        Ok(argv)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runs_the_compiled_binary_with_arguments() {
        let runner = CRunner;
        let argv = runner
            .launch_command("main.c", &["infinite".to_string()])
            .unwrap();
        assert_eq!(argv, vec!["/box/program", "infinite"]);

        if let Ok(Some(compile)) = runner.compile_command("main.c") {
            assert!(compile[0].ends_with("gcc"));
            assert!(compile.contains(&"/box/main.c".to_string()));
            assert!(compile.contains(&"/box/program".to_string()));
        }
    }
}
