use crate::result::Warning;
use parking_lot::Mutex;

const TRUNCATION_MARKER: &str = "[output truncated]\n";

/// Per-execution capture of script output and host warnings.
///
/// Nothing written here reaches the host's stdout; the buffer becomes
/// `ExecutionResult.output` when the execution ends.
pub struct Console {
    limit: usize,
    state: Mutex<ConsoleState>,
}

#[derive(Default)]
struct ConsoleState {
    output: String,
    warnings: Vec<Warning>,
    truncated: bool,
}

impl Console {
    pub fn new(limit_bytes: usize) -> Self {
        Self {
            limit: limit_bytes,
            state: Mutex::new(ConsoleState::default()),
        }
    }

    /// Append one line of output.
    pub fn write_line(&self, text: &str) {
        let mut state = self.state.lock();
        if state.truncated {
            return;
        }
        let needed = text.len() + 1;
        if state.output.len() + needed > self.limit {
            let room = self.limit.saturating_sub(state.output.len());
            let mut cut = room.min(text.len());
            while !text.is_char_boundary(cut) {
                cut -= 1;
            }
            state.output.push_str(&text[..cut]);
            if cut > 0 {
                state.output.push('\n');
            }
            state.output.push_str(TRUNCATION_MARKER);
            state.truncated = true;
            return;
        }
        state.output.push_str(text);
        state.output.push('\n');
    }

    /// Record a warning; it is also echoed to the output.
    pub fn warn(&self, message: impl Into<String>) {
        let message = message.into();
        self.write_line(&format!("[warn] {}", message));
        self.state.lock().warnings.push(Warning::new(message));
    }

    pub fn is_truncated(&self) -> bool {
        self.state.lock().truncated
    }

    /// Drain the captured output and warnings.
    pub fn take(&self) -> (String, Vec<Warning>) {
        let mut state = self.state.lock();
        (
            std::mem::take(&mut state.output),
            std::mem::take(&mut state.warnings),
        )
    }
}
