//! Voice cues through the platform speech command.

use log::{debug, info, warn};
use std::process::{Child, Command, Stdio};

use crate::traits::SpeechOutput;

/// Text spoken when a participant's target approaches.
pub fn call_text(name: &str) -> String {
    format!("{}, get ready", name)
}

#[cfg(target_os = "macos")]
const DEFAULT_PROGRAM: &str = "say";
#[cfg(not(target_os = "macos"))]
const DEFAULT_PROGRAM: &str = "espeak-ng";

/// Spawns a speech program per utterance without waiting for it.
///
/// If the program cannot be started the output disables itself and every
/// later call is a no-op.
pub struct CommandSpeech {
    program: String,
    available: bool,
    primed: bool,
    children: Vec<Child>,
}

impl CommandSpeech {
    pub fn new() -> Self {
        Self::with_program(DEFAULT_PROGRAM)
    }

    pub fn with_program(program: &str) -> Self {
        CommandSpeech {
            program: program.to_string(),
            available: true,
            primed: false,
            children: Vec::new(),
        }
    }

    pub fn is_available(&self) -> bool {
        self.available
    }

    fn quiet(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        cmd
    }

    fn build(&self, text: &str, volume: f32) -> Command {
        let mut cmd = self.quiet();
        if self.program != "say" {
            // espeak amplitude is 0-200, 100 being normal
            let amplitude = (volume.clamp(0.0, 1.0) * 100.0).round() as u32;
            cmd.arg("-a").arg(amplitude.to_string());
        }
        cmd.arg(text);
        cmd
    }
}

impl Default for CommandSpeech {
    fn default() -> Self {
        Self::new()
    }
}

impl SpeechOutput for CommandSpeech {
    fn speak(&mut self, text: &str, volume: f32) {
        if !self.available || volume <= 0.0 {
            return;
        }
        // Reap finished utterances.
        self.children.retain_mut(|c| matches!(c.try_wait(), Ok(None)));

        match self.build(text, volume).spawn() {
            Ok(child) => {
                debug!("[Speech] \"{}\"", text);
                self.children.push(child);
            }
            Err(e) => {
                warn!("[Speech] {} unavailable ({}), voice cues disabled", self.program, e);
                self.available = false;
            }
        }
    }

    /// Start the program once with empty input, which says nothing but
    /// finds out early whether it can run at all.
    fn unlock(&mut self) {
        if self.primed || !self.available {
            return;
        }
        self.primed = true;
        match self.quiet().spawn() {
            Ok(child) => {
                debug!("[Speech] {} ready", self.program);
                self.children.push(child);
            }
            Err(e) => {
                warn!("[Speech] {} unavailable ({}), voice cues disabled", self.program, e);
                self.available = false;
            }
        }
    }
}

/// Speech output for platforms without a speech program.
pub struct NullSpeech;

impl SpeechOutput for NullSpeech {
    fn speak(&mut self, text: &str, _volume: f32) {
        debug!("[Speech] (muted) \"{}\"", text);
    }

    fn unlock(&mut self) {}
}

/// Pick the command speech output if enabled, otherwise a muted one.
pub fn open(enabled: bool) -> Box<dyn SpeechOutput> {
    if enabled {
        Box::new(CommandSpeech::new())
    } else {
        info!("[Speech] Voice cues disabled");
        Box::new(NullSpeech)
    }
}
