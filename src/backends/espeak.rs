use super::SpeechBackend;

use std::io::{Error, ErrorKind, Read, Result};
use std::process::{Command, Stdio};
use std::time::Duration;
use wait_timeout::ChildExt;

const SYNTHESIS_TIMEOUT: Duration = Duration::from_secs(5);

pub struct EspeakBackend {
    binary: String,
    rate: u32,
}

impl EspeakBackend {
    /// `rate` is in words per minute.
    pub fn new(binary: &str, rate: u32) -> Self {
        Self {
            binary: binary.to_string(),
            rate,
        }
    }

    fn command(&self, text: &str) -> Command {
        let mut command = Command::new(&self.binary);
        command
            .arg("--stdout")
            .arg("-s")
            .arg(self.rate.to_string())
            .arg("--")
            .arg(text)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        command
    }
}

impl SpeechBackend for EspeakBackend {
    fn id(&self) -> &'static str {
        "espeak-ng"
    }

    fn synthesize(&self, text: &str) -> Result<Vec<u8>> {
        let mut child = self.command(text).spawn()?;

        // Drain stdout while waiting, or a long sentence fills the pipe and
        // espeak never exits.
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::new(ErrorKind::Other, "espeak stdout not captured"))?;
        let reader = std::thread::spawn(move || {
            let mut wav = Vec::new();
            stdout.read_to_end(&mut wav).map(|_| wav)
        });

        match child.wait_timeout(SYNTHESIS_TIMEOUT)? {
            Some(status) => {
                let wav = reader
                    .join()
                    .map_err(|_| Error::new(ErrorKind::Other, "espeak reader panicked"))??;
                if status.success() {
                    Ok(wav)
                } else {
                    let mut err_msg = String::new();
                    if let Some(mut stderr) = child.stderr.take() {
                        let _ = stderr.read_to_string(&mut err_msg);
                    }
                    Err(Error::new(
                        ErrorKind::Other,
                        format!("espeak error: {}", err_msg.trim()),
                    ))
                }
            }
            None => {
                // Timeout occurred, kill the process
                let _ = child.kill();
                let _ = child.wait();
                Err(Error::new(ErrorKind::TimedOut, "Backend timed out after 5s"))
            }
        }
    }
}
