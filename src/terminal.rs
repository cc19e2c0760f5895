//! ANSI banners and the decoder that turns raw process output into the
//! text carried by stdout events.

pub const TC_YELLOW: &str = "01;33";
pub const TC_GREEN: &str = "01;32";
pub const TC_GRAY: &str = "01;30";

pub fn term_color(color: &str, text: &str) -> String {
    format!("\u{1b}[{}m\u{1b}[K{}\u{1b}[m\u{1b}[K", color, text)
}

fn line(text: String) -> String {
    format!("\r\n{}\r\n", text)
}

pub fn welcome_banner(language: &str) -> String {
    line(term_color(TC_YELLOW, &format!("[ Welcome to {} ]", language)))
}

pub fn service_wait_notice() -> String {
    "Waiting for service ready...\r\n".to_string()
}

pub fn start_banner() -> String {
    line(term_color(TC_YELLOW, "[ start executing code ]"))
}

pub fn finished_banner(seconds: f64) -> String {
    line(format!(
        "{}{}{}",
        term_color(TC_YELLOW, "[ execution finished in "),
        term_color(TC_GREEN, &format!("{:.3}", seconds)),
        term_color(TC_YELLOW, " seconds ]"),
    ))
}

pub fn timeout_banner() -> String {
    line(term_color(TC_YELLOW, "[ execution timeout ]"))
}

pub fn restart_notice() -> String {
    line(term_color(TC_GRAY, "restarting repl..."))
}

/// Incremental decoder for one output stream.
///
/// Multi-byte UTF-8 sequences split across reads are held back until the
/// next chunk completes them. With `translate_newlines`, `\n` becomes `\r\n`.
#[derive(Debug, Default)]
pub struct OutputDecoder {
    translate_newlines: bool,
    pending: Vec<u8>,
}

impl OutputDecoder {
    pub fn new(translate_newlines: bool) -> Self {
        Self {
            translate_newlines,
            pending: Vec::new(),
        }
    }

    pub fn decode(&mut self, chunk: &[u8]) -> Option<String> {
        self.pending.extend_from_slice(chunk);
        let keep = incomplete_tail(&self.pending);
        let ready: Vec<u8> = self.pending.drain(..self.pending.len() - keep).collect();
        self.render(&ready)
    }

    /// Emit whatever is still buffered, replacing invalid bytes.
    pub fn flush(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.pending);
        self.render(&rest)
    }

    fn render(&self, bytes: &[u8]) -> Option<String> {
        if bytes.is_empty() {
            return None;
        }
        let text = String::from_utf8_lossy(bytes);
        if self.translate_newlines {
            Some(text.replace('\n', "\r\n"))
        } else {
            Some(text.into_owned())
        }
    }
}

/// Length of a trailing, still incomplete UTF-8 sequence.
fn incomplete_tail(bytes: &[u8]) -> usize {
    match std::str::from_utf8(bytes) {
        Ok(_) => 0,
        Err(e) if e.error_len().is_none() => bytes.len() - e.valid_up_to(),
        Err(_) => {
            // Invalid byte earlier on; only a truncated sequence at the very end is held back.
            let start = bytes.len().saturating_sub(3);
            (start..bytes.len())
                .rev()
                .find(|&i| bytes[i] & 0xC0 != 0x80)
                .filter(|&i| {
                    matches!(std::str::from_utf8(&bytes[i..]), Err(e) if e.error_len().is_none())
                })
                .map_or(0, |i| bytes.len() - i)
        }
    }
}
