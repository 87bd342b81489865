//! Heuristic scanner for shell output.
//!
//! Everything here is pure: the reader loop feeds complete lines in and
//! turns the returned [`LineEvent`]s into bus events. Matching is best
//! effort against arbitrary text, so misses are expected.

use regex::Regex;
use std::sync::OnceLock;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LineEvent {
    Cpu { load: String },
    Memory { used: String, total: String },
    Disk {
        used: String,
        total: String,
        percent: String,
    },
    ProcessStart { name: String, pid: u32 },
}

impl LineEvent {
    /// The status text shown for stat events; `None` for process starts.
    pub fn stat_text(&self) -> Option<String> {
        match self {
            LineEvent::Cpu { load } => Some(format!("CPU Load: {load}")),
            LineEvent::Memory { used, total } => Some(format!("Memory: {used}/{total}")),
            LineEvent::Disk {
                used,
                total,
                percent,
            } => Some(format!("Disk: {percent} ({used}/{total})")),
            LineEvent::ProcessStart { .. } => None,
        }
    }
}

fn pid_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)process ID[:=\s]*(\d+)").expect("static regex"))
}

fn load_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"load average:\s*([0-9.]+),\s*([0-9.]+),\s*([0-9.]+)").expect("static regex")
    })
}

#[derive(Clone, Debug)]
pub struct OutputClassifier {
    disk_mount: String,
}

impl Default for OutputClassifier {
    fn default() -> Self {
        Self::new("/")
    }
}

impl OutputClassifier {
    /// `disk_mount` is the mount point the `df` summary line must end with.
    pub fn new(disk_mount: impl Into<String>) -> Self {
        Self {
            disk_mount: disk_mount.into(),
        }
    }

    /// Every category is checked on its own, so one line may yield several events.
    pub fn classify(&self, line: &str) -> Vec<LineEvent> {
        let mut out = Vec::new();
        if let Some(ev) = process_start(line) {
            out.push(ev);
        }
        if let Some(ev) = cpu_load(line) {
            out.push(ev);
        }
        if let Some(ev) = memory(line) {
            out.push(ev);
        }
        if let Some(ev) = disk(line, &self.disk_mount) {
            out.push(ev);
        }
        out
    }
}

pub fn classify_line(line: &str) -> Vec<LineEvent> {
    OutputClassifier::default().classify(line)
}

fn process_start(line: &str) -> Option<LineEvent> {
    let lower = line.to_lowercase();
    let uvicorn = lower.contains("uvicorn");
    if !uvicorn && !lower.contains("server started") {
        return None;
    }
    let pid = pid_pattern().captures(line)?.get(1)?.as_str().parse().ok()?;
    let name = if uvicorn { "uvicorn" } else { "server" };
    Some(LineEvent::ProcessStart {
        name: name.to_string(),
        pid,
    })
}

fn cpu_load(line: &str) -> Option<LineEvent> {
    if !line.contains("load average:") {
        return None;
    }
    let caps = load_pattern().captures(line)?;
    Some(LineEvent::Cpu {
        load: caps.get(1)?.as_str().to_string(),
    })
}

fn memory(line: &str) -> Option<LineEvent> {
    if !line.starts_with("Mem:") {
        return None;
    }
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() < 4 {
        return None;
    }
    Some(LineEvent::Memory {
        total: parts[1].to_string(),
        used: parts[2].to_string(),
    })
}

fn disk(line: &str, mount: &str) -> Option<LineEvent> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() < 5 || parts[parts.len() - 1] != mount {
        return None;
    }
    let percent = parts[parts.len() - 2];
    if !percent.ends_with('%') {
        return None;
    }
    Some(LineEvent::Disk {
        total: parts[1].to_string(),
        used: parts[2].to_string(),
        percent: percent.to_string(),
    })
}

/// Splits a stream of text chunks into complete lines, keeping the trailing
/// partial line until its newline arrives.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: String,
}

impl LineBuffer {
    pub fn push(&mut self, chunk: &str) -> Vec<String> {
        self.pending.push_str(chunk);
        let Some(last_newline) = self.pending.rfind('\n') else {
            return Vec::new();
        };
        let rest = self.pending.split_off(last_newline + 1);
        let complete = std::mem::replace(&mut self.pending, rest);
        complete[..last_newline]
            .split('\n')
            .map(|line| line.trim_end_matches('\r').to_string())
            .collect()
    }

    pub fn pending(&self) -> &str {
        &self.pending
    }
}

/// Lossy UTF-8 decoding across chunk boundaries: a multi-byte character cut
/// in half by the transport is held back instead of being replaced.
#[derive(Debug, Default)]
pub struct ChunkDecoder {
    carry: Vec<u8>,
}

impl ChunkDecoder {
    pub fn decode(&mut self, chunk: &[u8]) -> String {
        let mut bytes = std::mem::take(&mut self.carry);
        bytes.extend_from_slice(chunk);
        let cut = incomplete_tail(&bytes);
        self.carry = bytes.split_off(bytes.len() - cut);
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

/// Length of a truncated (but so far valid) UTF-8 sequence at the end of `bytes`.
fn incomplete_tail(bytes: &[u8]) -> usize {
    let start = bytes.len().saturating_sub(3);
    for i in (start..bytes.len()).rev() {
        let b = bytes[i];
        if b & 0b1100_0000 == 0b1000_0000 {
            continue;
        }
        let need = match b {
            b if b & 0b1110_0000 == 0b1100_0000 => 2,
            b if b & 0b1111_0000 == 0b1110_0000 => 3,
            b if b & 0b1111_1000 == 0b1111_0000 => 4,
            _ => return 0,
        };
        let have = bytes.len() - i;
        return if have < need { have } else { 0 };
    }
    0
}
