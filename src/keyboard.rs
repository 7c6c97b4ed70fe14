//! # Keyboard position control
//!
//! Steers the vehicle in offboard position mode from the terminal. The vehicle starts at 1.5 m above the local origin
//! and every key press moves the position setpoint by one step:
//!
//! | Key | Log | Move |
//! |-----|-----|------|
//! | W | TOWARD | East + step |
//! | S | FORWARD | East - step |
//! | A | LEFT | North + step |
//! | D | RIGHT | North - step |
//! | Q | | End of the keyboard control |
//!
//! Keys are read without waiting for enter and without echo, see [RawTerminal].

use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

use flume::{Receiver, Sender};

use crate::subsystems::offboard::{OffboardControl, PositionNedYaw, Setpoint};
use crate::{Error, Result};

const TAG: &str = "Keyboard";
const START_DOWN_M: f32 = -1.5;
const KEY_POLL: Duration = Duration::from_millis(100);

/// Action bound to a key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyCommand {
    /// East + step
    Toward,
    /// East - step
    Forward,
    /// North + step
    Left,
    /// North - step
    Right,
    /// Leave keyboard control
    Quit,
}

impl KeyCommand {
    /// Decode a key, both cases are accepted
    pub fn from_byte(key: u8) -> Option<Self> {
        match key.to_ascii_uppercase() {
            b'W' => Some(KeyCommand::Toward),
            b'S' => Some(KeyCommand::Forward),
            b'A' => Some(KeyCommand::Left),
            b'D' => Some(KeyCommand::Right),
            b'Q' => Some(KeyCommand::Quit),
            _ => None,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            KeyCommand::Toward => "TOWARD",
            KeyCommand::Forward => "FORWARD",
            KeyCommand::Left => "LEFT",
            KeyCommand::Right => "RIGHT",
            KeyCommand::Quit => "QUIT",
        }
    }
}

/// Position setpoint moved by key commands
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KeyboardController {
    /// Current north setpoint (meters)
    pub north: f32,
    /// Current east setpoint (meters)
    pub east: f32,
    /// Current down setpoint (meters)
    pub down: f32,
    /// Move per key press (meters)
    pub step: f32,
}

impl KeyboardController {
    /// Controller at the start position
    pub fn new(step: f32) -> Self {
        Self {
            north: 0.0,
            east: 0.0,
            down: START_DOWN_M,
            step,
        }
    }

    /// Current position setpoint, facing North
    pub fn position(&self) -> PositionNedYaw {
        PositionNedYaw {
            north_m: self.north,
            east_m: self.east,
            down_m: self.down,
            yaw_deg: 0.0,
        }
    }

    /// Apply a movement key, returns the new setpoint
    ///
    /// Returns `None` for [KeyCommand::Quit].
    pub fn apply(&mut self, command: KeyCommand) -> Option<PositionNedYaw> {
        match command {
            KeyCommand::Toward => self.east += self.step,
            KeyCommand::Forward => self.east -= self.step,
            KeyCommand::Left => self.north += self.step,
            KeyCommand::Right => self.north -= self.step,
            KeyCommand::Quit => return None,
        }
        Some(self.position())
    }
}

/// Blocking source of key presses
pub trait KeySource: Send {
    /// Wait a short time for a key
    ///
    /// Returns `Ok(None)` if no key was pressed in the meantime. A closed input is reported as an
    /// [io::ErrorKind::UnexpectedEof] terminal error.
    fn next_key(&mut self) -> Result<Option<u8>>;
}

/// Standard input in non-canonical mode without echo
///
/// The original terminal settings are restored when dropped.
pub struct RawTerminal {
    fd: RawFd,
    original: libc::termios,
}

impl RawTerminal {
    /// Switch standard input to raw key reading
    pub fn new() -> Result<Self> {
        let fd = libc::STDIN_FILENO;

        // SAFETY: termios is plain old data, it is fully written by tcgetattr before use
        let mut original: libc::termios = unsafe { std::mem::zeroed() };
        // SAFETY: `original` is a valid termios to write to, an invalid fd is reported as an error
        if unsafe { libc::tcgetattr(fd, &mut original) } != 0 {
            return Err(Error::Terminal(io::Error::last_os_error()));
        }

        let mut raw = original;
        raw.c_lflag &= !(libc::ICANON | libc::ECHO);
        // SAFETY: `raw` is an initialized termios that outlives the call
        if unsafe { libc::tcsetattr(fd, libc::TCSANOW, &raw) } != 0 {
            return Err(Error::Terminal(io::Error::last_os_error()));
        }

        Ok(Self { fd, original })
    }
}

impl KeySource for RawTerminal {
    fn next_key(&mut self) -> Result<Option<u8>> {
        let mut pollfd = libc::pollfd {
            fd: self.fd,
            events: libc::POLLIN,
            revents: 0,
        };
        // SAFETY: a single pollfd that lives on the stack for the whole call
        let ready = unsafe { libc::poll(&mut pollfd, 1, KEY_POLL.as_millis() as libc::c_int) };
        match ready {
            0 => return Ok(None),
            n if n < 0 => {
                let error = io::Error::last_os_error();
                if error.kind() == io::ErrorKind::Interrupted {
                    return Ok(None);
                }
                return Err(Error::Terminal(error));
            }
            _ => (),
        }

        // Unbuffered so that poll() sees every pending byte
        let mut key = 0u8;
        // SAFETY: reads at most one byte into `key`, which is one byte long
        let read = unsafe { libc::read(self.fd, (&mut key as *mut u8).cast(), 1) };
        match read {
            1 => Ok(Some(key)),
            0 => Err(Error::Terminal(io::ErrorKind::UnexpectedEof.into())),
            _ => Err(Error::Terminal(io::Error::last_os_error())),
        }
    }
}

impl Drop for RawTerminal {
    fn drop(&mut self) {
        // SAFETY: `original` was filled by tcgetattr on the same fd in new()
        if unsafe { libc::tcsetattr(self.fd, libc::TCSANOW, &self.original) } != 0 {
            log::warn!(
                "Could not restore terminal settings: {}",
                io::Error::last_os_error()
            );
        }
    }
}

fn read_keys<K: KeySource>(mut keys: K, keys_tx: Sender<Result<u8>>) {
    loop {
        match keys.next_key() {
            Ok(Some(key)) => {
                if keys_tx.send(Ok(key)).is_err() {
                    return;
                }
            }
            Ok(None) => {
                if keys_tx.is_disconnected() {
                    return;
                }
            }
            Err(e) => {
                let _ = keys_tx.send(Err(e));
                return;
            }
        }
    }
}

/// Steer the vehicle in offboard position mode until Q is pressed
///
/// Offboard mode is started at the start position and stopped when leaving, the vehicle then holds its position.
/// A closed keyboard input ends the control like Q.
pub async fn keyboard_control<K>(control: &dyn OffboardControl, keys: K, step: f32) -> Result<()>
where
    K: KeySource + 'static,
{
    let (keys_tx, keys_rx) = flume::unbounded();
    let reader = tokio::task::spawn_blocking(move || read_keys(keys, keys_tx));

    let result = drive(control, &keys_rx, step).await;

    // The reader notices the closed channel at its next poll and releases the keys
    drop(keys_rx);
    let _ = reader.await;

    result
}

async fn drive(
    control: &dyn OffboardControl,
    keys: &Receiver<Result<u8>>,
    step: f32,
) -> Result<()> {
    let mut controller = KeyboardController::new(step);

    log::info!("[{}] W/S: east, A/D: north, Q: quit", TAG);
    control
        .set_setpoint(Setpoint::PositionNed(controller.position()))
        .await?;
    control.start().await?;
    log::info!("[{}] Offboard started", TAG);

    loop {
        let key = match keys.recv_async().await? {
            Ok(key) => key,
            Err(Error::Terminal(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
                log::warn!("[{}] Keyboard input closed", TAG);
                break;
            }
            Err(e) => return Err(e),
        };

        let Some(command) = KeyCommand::from_byte(key) else {
            continue;
        };
        let Some(position) = controller.apply(command) else {
            break;
        };
        log::info!("[{}] {}", TAG, command.label());
        control.set_setpoint(Setpoint::PositionNed(position)).await?;
    }

    control.stop().await?;
    log::info!("[{}] Offboard stopped", TAG);

    Ok(())
}
