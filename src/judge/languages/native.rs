use crate::config::types::{RunError, Submission};
use crate::judge::runner::{in_box, LanguageRunner};

/// Prebuilt executables, copied in and run as-is
#[derive(Debug, Clone, Default)]
pub struct NativeRunner;

impl LanguageRunner for NativeRunner {
    fn language(&self) -> &'static str {
        "native"
    }

    fn aliases(&self) -> &'static [&'static str] {
        &["binary", "exe"]
    }

    fn staged_name(&self, _submission: &Submission) -> String {
        "program".to_string()
    }

    fn staged_mode(&self) -> u32 {
        0o755
    }

    fn launch_command(&self, staged: &str, args: &[String]) -> Result<Vec<String>, RunError> {
        let mut argv = vec![in_box(staged)];
        argv.extend(args.iter().cloned());
        Ok(argv)
    }
}
