use bitflags::bitflags;
use thiserror::Error;

bitflags!(
    /// Warning flag reported in every reply. `F*` codes are faults, the rest
    /// are advisory.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Warnings: u16 {
        const CRITICAL_ERROR = 0b0000_0000_0001;
        const DRIVER_DISABLED = 0b0000_0000_0010;
        const STALLED = 0b0000_0000_0100;
        const ENCODER_ERROR = 0b0000_0000_1000;
        const OTHER_FAULT = 0b0000_0001_0000;
        const UNEXPECTED_LIMIT = 0b0000_0010_0000;
        const NO_REFERENCE = 0b0000_0100_0000;
        const MANUAL_CONTROL = 0b0000_1000_0000;
        const OTHER_WARNING = 0b0001_0000_0000;
        const NOTE = 0b0010_0000_0000;

        const FAULTS = Self::CRITICAL_ERROR.bits()
            | Self::DRIVER_DISABLED.bits()
            | Self::STALLED.bits()
            | Self::ENCODER_ERROR.bits()
            | Self::OTHER_FAULT.bits();
    }
);

impl Warnings {
    pub fn from_code(code: &str) -> Self {
        match code {
            "--" => Warnings::empty(),
            "FF" => Warnings::CRITICAL_ERROR,
            "FD" => Warnings::DRIVER_DISABLED,
            "FS" => Warnings::STALLED,
            "FQ" => Warnings::ENCODER_ERROR,
            "WL" => Warnings::UNEXPECTED_LIMIT,
            "WR" => Warnings::NO_REFERENCE,
            "NC" | "NI" => Warnings::MANUAL_CONTROL,
            c if c.starts_with('F') => Warnings::OTHER_FAULT,
            c if c.starts_with('W') => Warnings::OTHER_WARNING,
            _ => Warnings::NOTE,
        }
    }

    pub fn is_fault(&self) -> bool {
        self.intersects(Warnings::FAULTS)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("empty line")]
    Empty,
    #[error("not a reply: {0:?}")]
    NotAReply(String),
    #[error("malformed {field} in {line:?}")]
    Malformed { field: &'static str, line: String },
}

/// Kind of line received from the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineKind {
    Reply,
    Alert,
    Info,
    Other,
}

impl LineKind {
    pub fn of(line: &str) -> Self {
        match line.trim_start().chars().next() {
            Some('@') => LineKind::Reply,
            Some('!') => LineKind::Alert,
            Some('#') => LineKind::Info,
            _ => LineKind::Other,
        }
    }
}

/// `@<device> <axis> <OK|RJ> <IDLE|BUSY> <warning> <data>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub device: u8,
    pub axis: u8,
    pub accepted: bool,
    pub busy: bool,
    pub warning: Warnings,
    pub data: String,
}

impl Reply {
    pub fn parse(line: &str) -> Result<Self, ParseError> {
        let line = line.trim();
        if line.is_empty() {
            return Err(ParseError::Empty);
        }
        let body = line
            .strip_prefix('@')
            .ok_or_else(|| ParseError::NotAReply(line.to_string()))?;
        // optional ":CC" checksum suffix
        let body = match body.rsplit_once(':') {
            Some((message, checksum))
                if checksum.len() == 2 && checksum.chars().all(|c| c.is_ascii_hexdigit()) =>
            {
                message
            }
            _ => body,
        };

        let malformed = |field| ParseError::Malformed {
            field,
            line: line.to_string(),
        };
        let mut fields = body.split_whitespace();
        let device = fields
            .next()
            .and_then(|f| f.parse().ok())
            .ok_or_else(|| malformed("device"))?;
        let axis = fields
            .next()
            .and_then(|f| f.parse().ok())
            .ok_or_else(|| malformed("axis"))?;
        let accepted = match fields.next() {
            Some("OK") => true,
            Some("RJ") => false,
            _ => return Err(malformed("reply flag")),
        };
        let busy = match fields.next() {
            Some("BUSY") => true,
            Some("IDLE") => false,
            _ => return Err(malformed("status")),
        };
        let warning = fields
            .next()
            .map(Warnings::from_code)
            .ok_or_else(|| malformed("warning"))?;
        let data = fields.collect::<Vec<_>>().join(" ");

        Ok(Reply {
            device,
            axis,
            accepted,
            busy,
            warning,
            data,
        })
    }

    pub fn data_as_i64(&self) -> Result<i64, ParseError> {
        self.data.parse().map_err(|_| ParseError::Malformed {
            field: "data",
            line: self.data.clone(),
        })
    }
}
