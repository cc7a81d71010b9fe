// Step-bridge serial protocol
//
// The host computes motion; a small MCU turns each tick's pulse batch into
// STEP/DIR edges. Packet format:
// [0xFF, 0xFF, ID, Length, Instruction, Params..., Checksum]

use serialport::{self, SerialPort};
use std::io::{Read, Write};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::axis::{Direction, MotorId};
use super::driver::StepSink;

/// Default serial configuration for the bridge
pub const DEFAULT_BAUDRATE: u32 = 1_000_000;
pub const DEFAULT_TIMEOUT_MS: u64 = 100;

/// Bridge device ID on the bus
pub const BRIDGE_ID: u8 = 0x01;

/// Packet header bytes
const HEADER: [u8; 2] = [0xFF, 0xFF];

/// Instruction set
#[repr(u8)]
#[derive(Debug, Clone, Copy)]
pub enum Instruction {
    Ping = 0x01,
    /// Params: per motor (X1, X2, Y) a sign-magnitude u16 pulse count
    Step = 0x10,
    /// Params: 0 = release, 1 = energize
    Enable = 0x11,
    /// Params: 0 = up, 1 = down
    Pen = 0x12,
}

/// Error types for step-bridge communication
#[derive(Debug, thiserror::Error)]
pub enum StepBusError {
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid response from bridge {id}: {reason}")]
    InvalidResponse { id: u8, reason: String },

    #[error("Checksum mismatch for bridge {id}")]
    ChecksumMismatch { id: u8 },

    #[error("Bridge {id} returned error status: 0x{status:02X}")]
    BridgeError { id: u8, status: u8 },

    #[error("Timeout waiting for response from bridge {id}")]
    Timeout { id: u8 },

    #[error("Step batch overflow on motor {motor}: {pulses} pulses in one tick")]
    Overflow { motor: MotorId, pulses: i64 },
}

pub type Result<T> = std::result::Result<T, StepBusError>;

/// One write to the bridge
#[derive(Debug, Clone, Copy, PartialEq)]
enum BridgeWrite {
    Enable(bool),
    Pen(bool),
    Steps([i64; 3]),
}

/// Output buffered during a tick. Entries are cleared only once their write
/// succeeds, so anything that failed goes out again on the next flush.
#[derive(Debug, Clone, Default)]
struct TickBatch {
    steps: [i64; 3],
    enable: Option<bool>,
    pen: Option<bool>,
}

impl TickBatch {
    /// Energize before pulses, release after them
    fn flush(&mut self, mut write: impl FnMut(BridgeWrite) -> Result<()>) -> Result<()> {
        if self.enable == Some(true) {
            write(BridgeWrite::Enable(true))?;
            self.enable = None;
        }
        if let Some(down) = self.pen {
            write(BridgeWrite::Pen(down))?;
            self.pen = None;
        }
        if self.steps != [0; 3] {
            write(BridgeWrite::Steps(self.steps))?;
            self.steps = [0; 3];
        }
        if self.enable == Some(false) {
            write(BridgeWrite::Enable(false))?;
            self.enable = None;
        }
        Ok(())
    }
}

/// Serial link to the step-bridge MCU
pub struct StepBus {
    port: Box<dyn SerialPort>,
    id: u8,
    batch: TickBatch,
}

impl StepBus {
    /// Open a new connection to the bridge
    pub fn open(port_name: &str) -> Result<Self> {
        Self::open_with_baudrate(port_name, DEFAULT_BAUDRATE)
    }

    /// Open with custom baudrate
    pub fn open_with_baudrate(port_name: &str, baudrate: u32) -> Result<Self> {
        info!("Opening step bridge on {} @ {} baud", port_name, baudrate);
        let port = serialport::new(port_name, baudrate)
            .timeout(Duration::from_millis(DEFAULT_TIMEOUT_MS))
            .open()?;

        Ok(Self {
            port,
            id: BRIDGE_ID,
            batch: TickBatch::default(),
        })
    }

    /// Calculate checksum for a packet (excluding header)
    fn checksum(data: &[u8]) -> u8 {
        let sum: u16 = data.iter().map(|&b| b as u16).sum();
        (!sum & 0xFF) as u8
    }

    /// Build a packet with header and checksum
    fn build_packet(id: u8, instruction: Instruction, params: &[u8]) -> Vec<u8> {
        let length = (params.len() + 2) as u8; // params + instruction + checksum
        let mut packet = Vec::with_capacity(6 + params.len());

        packet.extend_from_slice(&HEADER);
        packet.push(id);
        packet.push(length);
        packet.push(instruction as u8);
        packet.extend_from_slice(params);

        // Checksum over id, length, instruction, params
        let checksum_data = &packet[2..]; // skip header
        packet.push(Self::checksum(checksum_data));

        packet
    }

    fn send_packet(&mut self, packet: &[u8]) -> Result<()> {
        self.port.write_all(packet)?;
        self.port.flush()?;
        Ok(())
    }

    /// Read a status packet
    fn read_response(&mut self, expected_id: u8) -> Result<Vec<u8>> {
        let mut header = [0u8; 2];
        self.port.read_exact(&mut header).map_err(|e| {
            if e.kind() == std::io::ErrorKind::TimedOut {
                StepBusError::Timeout { id: expected_id }
            } else {
                StepBusError::Io(e)
            }
        })?;

        if header != HEADER {
            return Err(StepBusError::InvalidResponse {
                id: expected_id,
                reason: format!("Invalid header: {:02X?}", header),
            });
        }

        let mut id_length = [0u8; 2];
        self.port.read_exact(&mut id_length)?;
        let id = id_length[0];
        let length = id_length[1] as usize;

        if id != expected_id {
            return Err(StepBusError::InvalidResponse {
                id: expected_id,
                reason: format!("ID mismatch: expected {}, got {}", expected_id, id),
            });
        }
        if length < 2 {
            return Err(StepBusError::InvalidResponse {
                id,
                reason: format!("Length {} too short", length),
            });
        }

        // status + params + checksum = length bytes
        let mut remaining = vec![0u8; length];
        self.port.read_exact(&mut remaining)?;

        let mut checksum_data = vec![id, length as u8];
        checksum_data.extend_from_slice(&remaining[..remaining.len() - 1]);
        if Self::checksum(&checksum_data) != remaining[remaining.len() - 1] {
            return Err(StepBusError::ChecksumMismatch { id });
        }

        let status = remaining[0];
        if status != 0 {
            return Err(StepBusError::BridgeError { id, status });
        }

        Ok(remaining[1..remaining.len() - 1].to_vec())
    }

    /// Ping the bridge to check it is connected
    pub fn ping(&mut self) -> Result<bool> {
        let packet = Self::build_packet(self.id, Instruction::Ping, &[]);
        self.send_packet(&packet)?;

        match self.read_response(self.id) {
            Ok(_) => Ok(true),
            Err(StepBusError::Timeout { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Acknowledged single-byte write
    fn write_flag(&mut self, instruction: Instruction, value: bool) -> Result<()> {
        let packet = Self::build_packet(self.id, instruction, &[value as u8]);
        debug!("Bridge {:?} <- {}", instruction, value);
        self.send_packet(&packet)?;
        let _ = self.read_response(self.id)?;
        Ok(())
    }

    /// Step batches are fire-and-forget, like a sync write
    fn write_steps(&mut self, steps: [i64; 3]) -> Result<()> {
        let params = encode_step_params(steps)?;
        let packet = Self::build_packet(self.id, Instruction::Step, &params);
        self.send_packet(&packet)
    }
}

impl StepSink for StepBus {
    type Error = StepBusError;

    fn emit_step(&mut self, motor: MotorId, direction: Direction) {
        self.batch.steps[motor.index()] += direction.sign();
    }

    fn set_enabled(&mut self, enabled: bool) {
        self.batch.enable = Some(enabled);
    }

    fn set_pen(&mut self, down: bool) {
        self.batch.pen = Some(down);
    }

    fn end_tick(&mut self) -> Result<()> {
        let mut batch = std::mem::take(&mut self.batch);
        let result = batch.flush(|write| match write {
            BridgeWrite::Enable(on) => self.write_flag(Instruction::Enable, on),
            BridgeWrite::Pen(down) => self.write_flag(Instruction::Pen, down),
            BridgeWrite::Steps(steps) => self.write_steps(steps),
        });
        self.batch = batch;
        result
    }
}

impl Drop for StepBus {
    fn drop(&mut self) {
        // Lift the pen and release the motors (safety measure)
        if let Err(e) = self.write_flag(Instruction::Pen, false) {
            warn!("Failed to lift pen on drop: {}", e);
        }
        if let Err(e) = self.write_flag(Instruction::Enable, false) {
            warn!("Failed to release motors on drop: {}", e);
        }
    }
}

/// Encode one tick's pulse counts, X1, X2, Y order, little-endian
fn encode_step_params(steps: [i64; 3]) -> Result<Vec<u8>> {
    let mut params = Vec::with_capacity(6);
    for (motor, &pulses) in MotorId::ALL.iter().zip(steps.iter()) {
        if pulses.abs() > 0x7FFF {
            return Err(StepBusError::Overflow {
                motor: *motor,
                pulses,
            });
        }
        let raw = encode_sign_magnitude(pulses as i16);
        params.extend_from_slice(&raw.to_le_bytes());
    }
    Ok(params)
}

/// Encode a signed value to sign-magnitude format
/// Bit 15 = sign (1 = reverse), Bits 0-14 = magnitude
fn encode_sign_magnitude(value: i16) -> u16 {
    if value >= 0 {
        value as u16
    } else {
        0x8000 | value.unsigned_abs()
    }
}

#[cfg(test)]
fn decode_sign_magnitude(raw: u16) -> i16 {
    let magnitude = (raw & 0x7FFF) as i16;
    if raw & 0x8000 != 0 { -magnitude } else { magnitude }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum() {
        // ID=1, Length=3, Instruction=ENABLE, param=1
        let data = [1u8, 3, 0x11, 1];
        // ~(1+3+17+1) = ~22 = 233
        assert_eq!(StepBus::checksum(&data), 233);
    }

    #[test]
    fn test_sign_magnitude_encoding() {
        assert_eq!(encode_sign_magnitude(0), 0);
        assert_eq!(encode_sign_magnitude(3), 3);
        assert_eq!(encode_sign_magnitude(-3), 0x8003);
        assert_eq!(encode_sign_magnitude(-1), 0x8001);

        assert_eq!(decode_sign_magnitude(0x8003), -3);
        assert_eq!(decode_sign_magnitude(2), 2);
    }

    #[test]
    fn test_build_ping_packet() {
        let packet = StepBus::build_packet(BRIDGE_ID, Instruction::Ping, &[]);
        // Header (2) + ID (1) + Length (1) + Instruction (1) + Checksum (1)
        assert_eq!(packet.len(), 6);
        assert_eq!(&packet[..2], &HEADER);
        assert_eq!(packet[2], BRIDGE_ID);
        assert_eq!(packet[3], 2);
        assert_eq!(packet[4], 0x01);
    }

    #[test]
    fn test_step_params_layout() {
        let params = encode_step_params([2, 2, -1]).unwrap();
        assert_eq!(params, vec![0x02, 0x00, 0x02, 0x00, 0x01, 0x80]);

        let packet = StepBus::build_packet(BRIDGE_ID, Instruction::Step, &params);
        assert_eq!(packet.len(), 6 + params.len());
        assert_eq!(packet[3] as usize, params.len() + 2);
        let sum: u16 = packet[2..packet.len() - 1].iter().map(|&b| b as u16).sum();
        assert_eq!(packet[packet.len() - 1], (!sum & 0xFF) as u8);
    }

    #[test]
    fn test_batch_flush_order() {
        let mut batch = TickBatch {
            steps: [1, 1, -2],
            enable: Some(true),
            pen: Some(true),
        };
        let mut seen = Vec::new();
        batch
            .flush(|write| {
                seen.push(write);
                Ok(())
            })
            .unwrap();
        assert_eq!(
            seen,
            vec![
                BridgeWrite::Enable(true),
                BridgeWrite::Pen(true),
                BridgeWrite::Steps([1, 1, -2])
            ]
        );

        // Release goes out after the last pulses
        batch.steps = [0, 0, 3];
        batch.enable = Some(false);
        seen.clear();
        batch
            .flush(|write| {
                seen.push(write);
                Ok(())
            })
            .unwrap();
        assert_eq!(
            seen,
            vec![BridgeWrite::Steps([0, 0, 3]), BridgeWrite::Enable(false)]
        );
    }

    #[test]
    fn test_failed_enable_is_retried_before_steps() {
        let mut batch = TickBatch {
            steps: [2, 2, 0],
            enable: Some(true),
            pen: None,
        };
        let mut seen = Vec::new();
        let result = batch.flush(|write| {
            seen.push(write);
            Err(StepBusError::Timeout { id: BRIDGE_ID })
        });
        assert!(matches!(result, Err(StepBusError::Timeout { .. })));
        // Nothing after the failed enable was shipped
        assert_eq!(seen, vec![BridgeWrite::Enable(true)]);

        // Steps from the next tick pile onto the unsent ones
        batch.steps[0] += 1;
        batch.steps[1] += 1;
        seen.clear();
        batch
            .flush(|write| {
                seen.push(write);
                Ok(())
            })
            .unwrap();
        assert_eq!(
            seen,
            vec![BridgeWrite::Enable(true), BridgeWrite::Steps([3, 3, 0])]
        );
        assert_eq!(batch.enable, None);
        assert_eq!(batch.steps, [0; 3]);
    }

    #[test]
    fn test_failed_step_write_keeps_batch() {
        let mut batch = TickBatch {
            steps: [0, 0, -4],
            enable: None,
            pen: Some(false),
        };
        let result = batch.flush(|write| match write {
            BridgeWrite::Steps(_) => Err(StepBusError::Timeout { id: BRIDGE_ID }),
            _ => Ok(()),
        });
        assert!(result.is_err());
        assert_eq!(batch.pen, None);
        assert_eq!(batch.steps, [0, 0, -4]);
    }

    #[test]
    fn test_step_params_overflow() {
        assert!(matches!(
            encode_step_params([0, 40_000, 0]),
            Err(StepBusError::Overflow {
                motor: MotorId::X2,
                ..
            })
        ));
    }
}
