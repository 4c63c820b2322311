//! Build subprocess orchestration and image tag scraping.

use super::command::escape;
use super::locator::{BuildLocator, build_script_help};
use super::{BuildCommand, BuildError, BuildKind, Result};
use crate::console::{AppConsole, LogType};
use crate::deploy::DeploymentRecord;
use crate::env::boot;
use crate::runtime::{ImageSnapshot, RuntimeTarget};
use crate::store::ImageLedger;
use regex::Regex;
use std::path::Path;
use std::process::Stdio;
use std::sync::LazyLock;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Prefix some build tools put in front of images of the default registry.
pub const DEFAULT_REGISTRY_PREFIX: &str = "docker.io/library/";

/// Maven flag keeping devtools in the repackaged jar.
pub const MAVEN_DEVTOOLS_FLAG: &str = "-Dspring-boot.repackage.excludeDevtools=false";

/// Image tag patterns in priority order.
const TAG_PATTERNS: &[&str] = &[
    // Spring Boot buildpacks (Maven and Gradle plugins)
    r"Successfully built image.*'([^']+)'",
    // Classic docker build
    r"Successfully tagged (\S+)",
    // BuildKit
    r"naming to (\S+)",
    r"Successfully built ([0-9a-f]{12,64})\b",
    r"writing image (sha256:[0-9a-f]{64})",
];

static COMPILED_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    TAG_PATTERNS
        .iter()
        .map(|p| Regex::new(p).expect("image tag patterns are valid"))
        .collect()
});

/// Extracts the produced image tag from build output.
///
/// The winner is the highest-priority pattern that matched anywhere in the
/// output, not the pattern matching the latest line. Within one pattern the
/// last match wins.
#[derive(Debug, Clone)]
pub struct ImageTagScraper {
    captures: Vec<Option<String>>,
}

impl Default for ImageTagScraper {
    fn default() -> Self {
        Self::new()
    }
}

impl ImageTagScraper {
    /// Create a scraper that has seen no output.
    pub fn new() -> Self {
        Self {
            captures: vec![None; TAG_PATTERNS.len()],
        }
    }

    /// The pattern set, in priority order.
    pub fn patterns() -> Vec<String> {
        TAG_PATTERNS.iter().map(|p| p.to_string()).collect()
    }

    /// Match one output line.
    pub fn feed(&mut self, line: &str) {
        for (slot, pattern) in self.captures.iter_mut().zip(COMPILED_PATTERNS.iter()) {
            if let Some(captured) = pattern.captures(line).and_then(|c| c.get(1)) {
                *slot = Some(captured.as_str().to_string());
            }
        }
    }

    /// Tag captured by the highest-priority pattern that matched.
    pub fn tag(&self) -> Option<&str> {
        self.captures.iter().flatten().next().map(String::as_str)
    }
}

/// Strip the default registry prefix from an image tag.
pub fn normalize_image_tag(tag: &str) -> &str {
    tag.strip_prefix(DEFAULT_REGISTRY_PREFIX).unwrap_or(tag)
}

/// Builds project images.
pub struct BuildPipeline<'a> {
    target: &'a RuntimeTarget,
    ledger: &'a ImageLedger,
}

impl<'a> BuildPipeline<'a> {
    /// Pipeline building against `target`, recording images in `ledger`.
    pub fn new(target: &'a RuntimeTarget, ledger: &'a ImageLedger) -> Self {
        Self { target, ledger }
    }

    /// Resolve the build command for the record's project.
    ///
    /// # Errors
    ///
    /// Returns [`BuildError::NoBuildScriptFound`] with every checked location
    /// when the project has no supported build mechanism.
    pub fn command(&self, directory: &Path, record: &DeploymentRecord) -> Result<BuildCommand> {
        let locator = BuildLocator::new(self.target.build_config());
        let located = locator.locate(directory);
        let Some(kind) = located.kind else {
            return Err(BuildError::NoBuildScriptFound {
                checked: located.checked,
            });
        };

        let mut argv = located.command;
        let wants_devtools = record
            .system_properties
            .contains_key(boot::DEVTOOLS_SECRET_PROP);
        let mut devtools = false;
        if wants_devtools {
            match kind {
                BuildKind::Maven => {
                    argv.push(MAVEN_DEVTOOLS_FLAG.to_string());
                    devtools = true;
                }
                BuildKind::Gradle => match self.target.build_cache().gradle_init_script() {
                    Ok(script) => {
                        argv.push("-I".to_string());
                        argv.push(script.to_string_lossy().into_owned());
                        devtools = true;
                    }
                    Err(e) => warn!("Building without devtools, no init script: {}", e),
                },
                BuildKind::Shell => {}
            }
        }

        Ok(BuildCommand {
            kind,
            argv,
            devtools,
        })
    }

    /// Build the record's project and return the produced image id.
    ///
    /// Output of the build streams to `console` as it arrives. Every image the
    /// produced tag resolves to is recorded in the ledger together with the
    /// project's current classpath flags.
    ///
    /// # Errors
    ///
    /// - [`BuildError::NoBuildScriptFound`] if no build mechanism exists (the
    ///   checked locations and a help text are written to the console)
    /// - [`BuildError::NoJvmFound`] if Maven/Gradle is needed but no JVM is configured
    /// - [`BuildError::BuildProcessFailed`] on a non-zero exit
    /// - [`BuildError::NoImageTagDetected`] if the output names no image
    pub async fn build(&self, record: &DeploymentRecord, console: &dyn AppConsole) -> Result<String> {
        let projects = self.target.projects();
        let directory = projects.project_dir(&record.name);

        let command = match self.command(&directory, record) {
            Ok(command) => command,
            Err(BuildError::NoBuildScriptFound { checked }) => {
                for path in &checked {
                    console.write(&format!("No build script found at {}", path.display()), LogType::Stderr);
                }
                let script_name = BuildLocator::new(self.target.build_config())
                    .script_name()
                    .to_string();
                for line in build_script_help(&script_name) {
                    console.write(&line, LogType::Stderr);
                }
                return Err(BuildError::NoBuildScriptFound { checked });
            }
            Err(e) => return Err(e),
        };

        let java_home = projects.java_home(&record.name);
        if java_home.is_none() && command.kind != BuildKind::Shell {
            return Err(BuildError::NoJvmFound(command.kind));
        }

        let rendered = escape(&command.argv);
        if let Some(ref home) = java_home {
            console.write(&format!("build.env.JAVA_HOME={}", home.display()), LogType::Stdout);
        }
        console.write(&format!("build.directory={}", directory.display()), LogType::Stdout);
        console.write(&format!("build.command={}", rendered), LogType::Stdout);
        console.log_command(&rendered);

        let tag = self
            .run(&command, &directory, java_home.as_deref(), console)
            .await?;
        let tag = normalize_image_tag(&tag).to_string();
        info!("Build of {} produced image {}", record.name, tag);

        let images = self.resolve(&tag).await?;
        let flags = projects.classpath_flags(&record.name);
        for image in &images {
            if let Err(e) = self.ledger.record(&record.name, &image.id, flags) {
                warn!("Failed to record image {} of {}: {}", image.id, record.name, e);
            }
        }

        let image_id = images
            .iter()
            .find(|image| image.repo_tags.iter().any(|t| *t == tag))
            .or_else(|| images.first())
            .map(|image| image.id.clone())
            .unwrap_or(tag);
        Ok(image_id)
    }

    async fn run(
        &self,
        command: &BuildCommand,
        directory: &Path,
        java_home: Option<&Path>,
        console: &dyn AppConsole,
    ) -> Result<String> {
        let (program, args) = command
            .argv
            .split_first()
            .ok_or(BuildError::NoImageTagDetected {
                patterns: ImageTagScraper::patterns(),
            })?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(directory)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(home) = java_home {
            cmd.env("JAVA_HOME", home);
        }

        debug!("Spawning build: {:?}", command.argv);
        let mut child = cmd.spawn()?;
        let stdout = child.stdout.take().ok_or_else(|| {
            std::io::Error::other("build stdout was not captured")
        })?;
        let stderr = child.stderr.take().ok_or_else(|| {
            std::io::Error::other("build stderr was not captured")
        })?;

        let mut stdout_lines = BufReader::new(stdout).lines();
        let mut stderr_lines = BufReader::new(stderr).lines();
        let mut stdout_open = true;
        let mut stderr_open = true;
        let mut scraper = ImageTagScraper::new();

        while stdout_open || stderr_open {
            tokio::select! {
                line = stdout_lines.next_line(), if stdout_open => {
                    match line {
                        Ok(Some(line)) => {
                            scraper.feed(&line);
                            console.write(&line, LogType::Stdout);
                        }
                        Ok(None) => stdout_open = false,
                        Err(e) => {
                            warn!("Error reading build stdout: {}", e);
                            stdout_open = false;
                        }
                    }
                }
                line = stderr_lines.next_line(), if stderr_open => {
                    match line {
                        Ok(Some(line)) => console.write(&line, LogType::Stderr),
                        Ok(None) => stderr_open = false,
                        Err(e) => {
                            warn!("Error reading build stderr: {}", e);
                            stderr_open = false;
                        }
                    }
                }
            }
        }

        let status = child.wait().await?;
        if !status.success() {
            return Err(BuildError::BuildProcessFailed {
                exit_code: status.code(),
            });
        }

        scraper
            .tag()
            .map(String::from)
            .ok_or_else(|| BuildError::NoImageTagDetected {
                patterns: ImageTagScraper::patterns(),
            })
    }

    /// Resolve a tag to images: by reference first, then as an id.
    async fn resolve(&self, tag: &str) -> Result<Vec<ImageSnapshot>> {
        let runtime = self.target.runtime();
        let images = runtime.list_images(Some(tag)).await?;
        if !images.is_empty() {
            return Ok(images);
        }
        Ok(vec![runtime.inspect_image(tag).await?])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_highest_priority_pattern_wins_globally() {
        let mut scraper = ImageTagScraper::new();
        scraper.feed("writing image sha256:0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef done");
        scraper.feed("Successfully tagged legacy:1");
        scraper.feed("[INFO] Successfully built image 'docker.io/library/demo:0.0.1'");
        scraper.feed("Successfully tagged legacy:2");
        assert_eq!(scraper.tag(), Some("docker.io/library/demo:0.0.1"));
    }

    #[test]
    fn test_lower_priority_pattern_used_alone() {
        let mut scraper = ImageTagScraper::new();
        scraper.feed("#8 naming to docker.io/library/app:latest done");
        assert_eq!(scraper.tag(), Some("docker.io/library/app:latest"));

        let mut scraper = ImageTagScraper::new();
        scraper.feed("Successfully built 4f2a9c1b7d3e");
        assert_eq!(scraper.tag(), Some("4f2a9c1b7d3e"));
    }

    #[test]
    fn test_no_match() {
        let mut scraper = ImageTagScraper::new();
        scraper.feed("BUILD SUCCESS");
        assert_eq!(scraper.tag(), None);
        assert_eq!(ImageTagScraper::patterns().len(), 5);
    }

    #[test]
    fn test_normalize_image_tag() {
        assert_eq!(normalize_image_tag("docker.io/library/x"), "x");
        assert_eq!(normalize_image_tag("x"), "x");
        assert_eq!(normalize_image_tag("ghcr.io/org/x:1"), "ghcr.io/org/x:1");
    }
}
