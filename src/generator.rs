//! Text-generation collaborator
//!
//! The analytics core never talks to a language model directly. It hands a
//! prompt to a [`TextGenerator`] and parses whatever text comes back.

use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use crate::error::CollaboratorError;

const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Sampling parameters forwarded to the collaborator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationParams {
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            model: "default".to_string(),
            temperature: 0.7,
            max_tokens: 800,
        }
    }
}

/// One generation call
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub prompt: String,
    pub params: GenerationParams,
}

/// `[generator]` section of the application config
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorSettings {
    /// External program that reads the prompt on stdin and writes the reply to stdout
    pub command: Option<String>,
    pub args: Vec<String>,
    pub timeout_seconds: u64,
    pub params: GenerationParams,
}

impl Default for GeneratorSettings {
    fn default() -> Self {
        Self {
            command: None,
            args: Vec::new(),
            timeout_seconds: 60,
            params: GenerationParams::default(),
        }
    }
}

impl GeneratorSettings {
    /// Build the configured collaborator
    pub fn build(&self) -> Box<dyn TextGenerator> {
        match &self.command {
            Some(program) if !program.trim().is_empty() => Box::new(CommandGenerator::new(
                program.clone(),
                self.args.clone(),
                Duration::from_secs(self.timeout_seconds),
            )),
            _ => Box::new(UnavailableGenerator),
        }
    }
}

/// Natural-language generation seam
pub trait TextGenerator: Send + Sync {
    /// Short name for logs
    fn name(&self) -> &str;

    fn generate(&self, request: &GenerationRequest) -> Result<String, CollaboratorError>;
}

/// Pipes the prompt through an external program
///
/// Generation parameters are passed as `LOADRS_MODEL`, `LOADRS_TEMPERATURE` and
/// `LOADRS_MAX_TOKENS` environment variables. The child is killed once the
/// timeout expires.
pub struct CommandGenerator {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandGenerator {
    pub fn new(program: impl Into<String>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args,
            timeout,
        }
    }
}

impl TextGenerator for CommandGenerator {
    fn name(&self) -> &str {
        &self.program
    }

    fn generate(&self, request: &GenerationRequest) -> Result<String, CollaboratorError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .env("LOADRS_MODEL", &request.params.model)
            .env("LOADRS_TEMPERATURE", request.params.temperature.to_string())
            .env("LOADRS_MAX_TOKENS", request.params.max_tokens.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| CollaboratorError::Unavailable(format!("failed to start {}: {}", self.program, e)))?;

        // Feed stdin and drain stdout/stderr off-thread so a chatty child cannot block on a full pipe
        let stdin = child.stdin.take();
        let prompt = request.prompt.clone();
        let writer = thread::spawn(move || {
            if let Some(mut stdin) = stdin {
                let _ = stdin.write_all(prompt.as_bytes());
            }
        });
        let stdout_reader = child.stdout.take().map(|mut stdout| {
            thread::spawn(move || {
                let mut buffer = String::new();
                let _ = stdout.read_to_string(&mut buffer);
                buffer
            })
        });
        let stderr_reader = child.stderr.take().map(|mut stderr| {
            thread::spawn(move || {
                let mut buffer = String::new();
                let _ = stderr.read_to_string(&mut buffer);
                buffer
            })
        });

        let started = Instant::now();
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) if started.elapsed() >= self.timeout => {
                    let _ = child.kill();
                    let _ = child.wait();
                    tracing::warn!(program = %self.program, timeout = ?self.timeout, "generator timed out");
                    return Err(CollaboratorError::Timeout {
                        seconds: self.timeout.as_secs(),
                    });
                }
                Ok(None) => thread::sleep(POLL_INTERVAL),
                Err(e) => return Err(CollaboratorError::Unavailable(e.to_string())),
            }
        };

        let _ = writer.join();
        let stdout = stdout_reader
            .and_then(|handle| handle.join().ok())
            .unwrap_or_default();
        let stderr = stderr_reader
            .and_then(|handle| handle.join().ok())
            .unwrap_or_default();

        if !status.success() {
            return Err(CollaboratorError::Unavailable(format!(
                "{} exited with {}: {}",
                self.program,
                status,
                stderr.trim()
            )));
        }

        if stdout.trim().is_empty() {
            return Err(CollaboratorError::EmptyReply);
        }

        tracing::debug!(
            program = %self.program,
            elapsed_ms = started.elapsed().as_millis() as u64,
            bytes = stdout.len(),
            "generator replied"
        );
        Ok(stdout)
    }
}

/// Collaborator used when no generator is configured; always fails
pub struct UnavailableGenerator;

impl TextGenerator for UnavailableGenerator {
    fn name(&self) -> &str {
        "unavailable"
    }

    fn generate(&self, _request: &GenerationRequest) -> Result<String, CollaboratorError> {
        Err(CollaboratorError::Unavailable("no text generator configured".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(prompt: &str) -> GenerationRequest {
        GenerationRequest {
            prompt: prompt.to_string(),
            params: GenerationParams::default(),
        }
    }

    #[test]
    fn test_unconfigured_settings_build_unavailable_generator() {
        let generator = GeneratorSettings::default().build();
        assert_eq!(generator.name(), "unavailable");
        assert!(matches!(
            generator.generate(&request("hi")),
            Err(CollaboratorError::Unavailable(_))
        ));
    }

    #[test]
    fn test_missing_program_is_unavailable() {
        let generator = CommandGenerator::new("loadrs-no-such-program", vec![], Duration::from_secs(1));
        assert!(matches!(
            generator.generate(&request("hi")),
            Err(CollaboratorError::Unavailable(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_command_generator_pipes_prompt() {
        let generator = CommandGenerator::new("cat", vec![], Duration::from_secs(5));
        let reply = generator.generate(&request("DAILY RECOMMENDATION: easy")).unwrap();
        assert_eq!(reply, "DAILY RECOMMENDATION: easy");
    }

    #[cfg(unix)]
    #[test]
    fn test_command_generator_passes_params_in_env() {
        let generator = CommandGenerator::new(
            "sh",
            vec!["-c".to_string(), "cat > /dev/null; echo $LOADRS_MAX_TOKENS".to_string()],
            Duration::from_secs(5),
        );
        let reply = generator.generate(&request("ignored")).unwrap();
        assert_eq!(reply.trim(), "800");
    }

    #[cfg(unix)]
    #[test]
    fn test_empty_reply_is_an_error() {
        let generator = CommandGenerator::new(
            "sh",
            vec!["-c".to_string(), "cat > /dev/null".to_string()],
            Duration::from_secs(5),
        );
        assert!(matches!(
            generator.generate(&request("anything")),
            Err(CollaboratorError::EmptyReply)
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_command_generator_times_out() {
        let generator = CommandGenerator::new(
            "sh",
            vec!["-c".to_string(), "sleep 5".to_string()],
            Duration::from_millis(200),
        );
        assert!(matches!(
            generator.generate(&request("slow")),
            Err(CollaboratorError::Timeout { .. })
        ));
    }
}
