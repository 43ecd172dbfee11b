use crate::config::types::{RunError, Submission};
use crate::judge::runner::{in_box, tool, LanguageRunner};

#[derive(Debug, Clone, Default)]
pub struct PythonRunner;

impl LanguageRunner for PythonRunner {
    fn language(&self) -> &'static str {
        "python"
    }

    fn aliases(&self) -> &'static [&'static str] {
        &["py", "python3"]
    }

    fn staged_name(&self, _submission: &Submission) -> String {
        "main.py".to_string()
    }

    // -B: /box stays free of bytecode caches; -S: no site-packages scan
    fn launch_command(&self, staged: &str, args: &[String]) -> Result<Vec<String>, RunError> {
        let mut argv = vec![
            tool("python3")?,
            "-B".to_string(),
            "-S".to_string(),
            in_box(staged),
        ];
        argv.extend(args.iter().cloned());
        Ok(argv)
    }
}
