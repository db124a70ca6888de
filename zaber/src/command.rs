use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instruction {
    /// Empty command, answered with the current status.
    Status,
    GetPosition,
    MoveAbsolute(i64),
    Home,
    Stop,
    SetMaxSpeed(u64),
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Instruction::Status => Ok(()),
            Instruction::GetPosition => write!(f, "get pos"),
            Instruction::MoveAbsolute(steps) => write!(f, "move abs {steps}"),
            Instruction::Home => write!(f, "home"),
            Instruction::Stop => write!(f, "stop"),
            Instruction::SetMaxSpeed(speed) => write!(f, "set maxspeed {speed}"),
        }
    }
}

/// A single request line. Device `0` addresses every device on the chain,
/// axis `0` addresses every axis of the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Request {
    pub device: u8,
    pub axis: u8,
    pub instruction: Instruction,
}

impl Request {
    pub fn new(device: u8, axis: u8, instruction: Instruction) -> Self {
        Self {
            device,
            axis,
            instruction,
        }
    }

    pub fn broadcast(instruction: Instruction) -> Self {
        Self::new(0, 0, instruction)
    }

    pub fn encode(&self) -> String {
        let mut line = format!("/{} {} {}", self.device, self.axis, self.instruction);
        line.truncate(line.trim_end().len());
        line.push('\n');
        line
    }
}
