use std::io::Write;
use std::process::{Command, ExitStatus, Stdio};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PlaybackError {
    #[error("Failed to start player '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Player exited with {0}")]
    Exit(ExitStatus),
    #[error("IO error talking to player: {0}")]
    Io(#[from] std::io::Error),
}

/// Destination for stimulus bytes once they have been read.
pub trait AudioSink: Send + Sync {
    fn play(&self, name: &str, bytes: &[u8]) -> Result<(), PlaybackError>;
}

/// Discards audio; used when no player is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl AudioSink for NullSink {
    fn play(&self, name: &str, bytes: &[u8]) -> Result<(), PlaybackError> {
        log::debug!("No player configured, skipping {} ({} bytes)", name, bytes.len());
        Ok(())
    }
}

/// Pipes stimulus bytes into an external player's stdin,
/// e.g. `["aplay", "-q", "-"]` or `["ffplay", "-nodisp", "-autoexit", "-"]`.
#[derive(Debug, Clone)]
pub struct CommandSink {
    program: String,
    args: Vec<String>,
}

impl CommandSink {
    /// `None` for an empty command line.
    pub fn from_argv(argv: &[String]) -> Option<Self> {
        let (program, args) = argv.split_first()?;
        Some(Self {
            program: program.clone(),
            args: args.to_vec(),
        })
    }
}

impl AudioSink for CommandSink {
    fn play(&self, name: &str, bytes: &[u8]) -> Result<(), PlaybackError> {
        log::debug!("Playing {} via {}", name, self.program);
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|source| PlaybackError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        // stdin is dropped when the match ends so the player sees EOF
        let written = match child.stdin.take() {
            Some(mut stdin) => stdin.write_all(bytes),
            None => Ok(()),
        };
        if written.is_err() {
            // Player stopped reading; make sure it is gone before reaping
            child.kill().ok();
        }

        let status = child.wait()?;
        written?;
        if !status.success() {
            return Err(PlaybackError::Exit(status));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_from_argv() {
        assert!(CommandSink::from_argv(&[]).is_none());
        let sink = CommandSink::from_argv(&argv(&["aplay", "-q", "-"])).unwrap();
        assert_eq!(sink.program, "aplay");
        assert_eq!(sink.args, vec!["-q", "-"]);
    }

    #[test]
    fn test_null_sink() {
        assert!(NullSink.play("A_x.wav", b"RIFF").is_ok());
    }

    #[cfg(unix)]
    #[test]
    fn test_command_sink_success() {
        let sink = CommandSink::from_argv(&argv(&["sh", "-c", "cat > /dev/null"])).unwrap();
        assert!(sink.play("A_x.wav", b"RIFF....WAVE").is_ok());
    }

    #[cfg(unix)]
    #[test]
    fn test_command_sink_failure() {
        let sink = CommandSink::from_argv(&argv(&["sh", "-c", "cat > /dev/null; exit 3"])).unwrap();
        assert!(matches!(sink.play("A_x.wav", b"RIFF"), Err(PlaybackError::Exit(_))));
    }

    /// Zombie children of this process whose command name is `comm`.
    #[cfg(target_os = "linux")]
    fn zombie_children(comm: &str) -> usize {
        let me = std::process::id().to_string();
        let wanted = format!("({comm})");
        std::fs::read_dir("/proc")
            .unwrap()
            .filter_map(|e| std::fs::read_to_string(e.ok()?.path().join("stat")).ok())
            .filter(|stat| {
                let Some(close) = stat.rfind(')') else {
                    return false;
                };
                let Some(open) = stat.find('(') else {
                    return false;
                };
                let mut rest = stat[close + 1..].split_whitespace();
                &stat[open..=close] == wanted && rest.next() == Some("Z") && rest.next() == Some(me.as_str())
            })
            .count()
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_command_sink_player_quits_early() {
        // `sleep` never reads stdin, so a large write hits a closed pipe
        let sink = CommandSink::from_argv(&argv(&["sleep", "0"])).unwrap();
        let audio = vec![0u8; 4 * 1024 * 1024];
        let err = sink.play("A_x.wav", &audio).unwrap_err();
        assert!(matches!(err, PlaybackError::Io(ref e) if e.kind() == std::io::ErrorKind::BrokenPipe));
        assert_eq!(zombie_children("sleep"), 0);
    }

    #[test]
    fn test_command_sink_missing_program() {
        let sink = CommandSink::from_argv(&argv(&["definitely-not-a-player-binary"])).unwrap();
        assert!(matches!(sink.play("A_x.wav", b"RIFF"), Err(PlaybackError::Spawn { .. })));
    }
}
