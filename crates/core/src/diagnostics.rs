//! Session diagnostics area and the bounded apply error buffer

/// Outcome recorded for the last statement of a session
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum DiagnosticsStatus {
    /// Nothing recorded
    #[default]
    Empty,
    /// Statement succeeded
    Ok {
        /// Rows changed
        affected_rows: u64,
        /// Auto-generated id, 0 if none
        last_insert_id: u64,
        /// Optional message
        message: String,
    },
    /// Statement failed
    Error {
        /// Error code
        code: u32,
        /// Error message
        message: String,
    },
}

/// A warning or error raised while executing a statement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Condition {
    /// Error code
    pub code: u32,
    /// Message text
    pub message: String,
}

/// Per-session diagnostics area
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Diagnostics {
    status: DiagnosticsStatus,
    conditions: Vec<Condition>,
}

impl Diagnostics {
    /// Empty diagnostics
    pub fn new() -> Self {
        Self::default()
    }

    /// Current status
    pub fn status(&self) -> &DiagnosticsStatus {
        &self.status
    }

    /// Conditions raised since the last reset
    pub fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    /// True if an error status is set
    pub fn is_error(&self) -> bool {
        matches!(self.status, DiagnosticsStatus::Error { .. })
    }

    /// Record success
    pub fn set_ok(&mut self, affected_rows: u64, last_insert_id: u64, message: impl Into<String>) {
        self.status = DiagnosticsStatus::Ok {
            affected_rows,
            last_insert_id,
            message: message.into(),
        };
    }

    /// Record an error; also kept as a condition
    pub fn set_error(&mut self, code: u32, message: impl Into<String>) {
        let message = message.into();
        self.conditions.push(Condition {
            code,
            message: message.clone(),
        });
        self.status = DiagnosticsStatus::Error { code, message };
    }

    /// Record a warning without touching the status
    pub fn push_warning(&mut self, code: u32, message: impl Into<String>) {
        self.conditions.push(Condition {
            code,
            message: message.into(),
        });
    }

    /// Clear status and conditions
    pub fn reset(&mut self) {
        self.status = DiagnosticsStatus::Empty;
        self.conditions.clear();
    }
}

/// Default capacity of [`ApplyErrorBuffer`]
pub const DEFAULT_APPLY_ERROR_BUFFER: usize = 2 * 1024;

/// Bounded text buffer summarizing why applying a write-set failed
///
/// Each condition is appended as `" <message>, Error_code: <code>;"`. Text
/// that does not fit is cut at a character boundary; the buffer never grows
/// past its capacity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyErrorBuffer {
    text: String,
    max_len: usize,
}

impl ApplyErrorBuffer {
    /// Buffer holding at most `max_len` bytes
    pub fn new(max_len: usize) -> Self {
        Self {
            text: String::new(),
            max_len,
        }
    }

    /// Replace the contents with a summary of `diagnostics`
    ///
    /// With no conditions recorded the status error (if any) is used;
    /// otherwise the buffer stays empty.
    pub fn store(&mut self, diagnostics: &Diagnostics) {
        self.text.clear();

        let mut append = |code: u32, message: &str| {
            let piece = format!(" {}, Error_code: {};", message, code);
            let room = self.max_len.saturating_sub(self.text.len());
            if room == 0 {
                return false;
            }
            if piece.len() <= room {
                self.text.push_str(&piece);
                true
            } else {
                let mut cut = room;
                while !piece.is_char_boundary(cut) {
                    cut -= 1;
                }
                self.text.push_str(&piece[..cut]);
                false
            }
        };

        if diagnostics.conditions().is_empty() {
            if let DiagnosticsStatus::Error { code, message } = diagnostics.status() {
                append(*code, message);
            }
            return;
        }
        for condition in diagnostics.conditions() {
            if !append(condition.code, &condition.message) {
                break;
            }
        }
    }

    /// Stored text
    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// Bytes stored
    pub fn len(&self) -> usize {
        self.text.len()
    }

    /// True if nothing is stored
    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    /// Capacity in bytes
    pub fn capacity(&self) -> usize {
        self.max_len
    }

    /// Drop stored text
    pub fn clear(&mut self) {
        self.text.clear();
    }
}

impl Default for ApplyErrorBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_APPLY_ERROR_BUFFER)
    }
}
