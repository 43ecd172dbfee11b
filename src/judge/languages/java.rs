use crate::config::types::{PathRule, RunError, Submission};
use crate::judge::runner::{tool, LanguageRunner, RunnerRequirements};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default)]
pub struct JavaRunner;

/// Name of the public class, which javac insists matches the file name
fn detect_class_name(source: &str) -> Option<String> {
    source.lines().find_map(|line| {
        let rest = line.trim().strip_prefix("public ")?;
        let rest = rest
            .trim_start_matches("final ")
            .trim_start_matches("abstract ")
            .strip_prefix("class ")?;
        let name: String = rest
            .chars()
            .take_while(|c| c.is_alphanumeric() || *c == '_' || *c == '$')
            .collect();
        (!name.is_empty()).then_some(name)
    })
}

impl LanguageRunner for JavaRunner {
    fn language(&self) -> &'static str {
        "java"
    }

    fn staged_name(&self, submission: &Submission) -> String {
        let class = std::fs::read_to_string(&submission.source)
            .ok()
            .and_then(|content| detect_class_name(&content))
            .unwrap_or_else(|| "Main".to_string());
        format!("{}.java", class)
    }

    fn compile_command(&self, staged: &str) -> Result<Option<Vec<String>>, RunError> {
        Ok(Some(vec![
            tool("javac")?,
            "-encoding".to_string(),
            "UTF-8".to_string(),
            "-d".to_string(),
            "/box".to_string(),
            format!("/box/{}", staged),
        ]))
    }

    fn launch_command(&self, staged: &str, args: &[String]) -> Result<Vec<String>, RunError> {
        let class = staged.trim_end_matches(".java").to_string();
        let mut argv = vec![
            tool("java")?,
            "-XX:+UseSerialGC".to_string(),
            "-Xss1m".to_string(),
            "-cp".to_string(),
            "/box".to_string(),
            class,
        ];
        argv.extend(args.iter().cloned());
        Ok(argv)
    }

    // The JVM reads /proc/self and starts a dozen threads before main()
    fn requirements(&self) -> RunnerRequirements {
        RunnerRequirements {
            extra_paths: vec![
                PathRule::optional("/etc/alternatives"),
                PathRule::optional("/etc/java-17-openjdk"),
                PathRule::optional("/etc/java-21-openjdk"),
            ],
            mount_proc: true,
            min_processes: Some(64),
            environment: BTreeMap::from([(
                "JAVA_TOOL_OPTIONS".to_string(),
                "-Dfile.encoding=UTF-8".to_string(),
            )]),
        }
    }

    fn compile_requirements(&self) -> RunnerRequirements {
        RunnerRequirements {
            min_processes: Some(256),
            ..self.requirements()
        }
    }
}
