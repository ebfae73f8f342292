//! Control protocol wire format.
//!
//! Requests and replies are fixed-size C structs in host byte order:
//!
//! ```text
//! request (36 bytes)            reply (20 bytes)
//! +--------+----------------+   +--------+----------------+
//! | action | port[0] (16)   |   | result | port (16)      |
//! |  u32   | port[1] (16)   |   |  u32   |                |
//! +--------+----------------+   +--------+----------------+
//! ```
//!
//! Names are NUL-padded. The reply's name is only set by a successful dump of
//! a paired port.

use std::fmt;

use thiserror::Error;

use crate::error::PortError;
use crate::port::{MAX_NAME_LEN, NAME_SIZE, NameError, PortName};

/// Size of an encoded request.
pub const REQUEST_LEN: usize = 4 + 2 * NAME_SIZE;

/// Size of an encoded reply.
pub const REPLY_LEN: usize = 4 + NAME_SIZE;

/// Requested operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Action {
    Add = 0,
    Remove = 1,
    Connect = 2,
    Disconnect = 3,
    Dump = 4,
}

impl TryFrom<u32> for Action {
    type Error = DecodeError;

    fn try_from(raw: u32) -> Result<Self, Self::Error> {
        match raw {
            0 => Ok(Action::Add),
            1 => Ok(Action::Remove),
            2 => Ok(Action::Connect),
            3 => Ok(Action::Disconnect),
            4 => Ok(Action::Dump),
            other => Err(DecodeError::UnknownAction(other)),
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Action::Add => "add",
            Action::Remove => "remove",
            Action::Connect => "connect",
            Action::Disconnect => "disconnect",
            Action::Dump => "dump",
        };
        f.write_str(s)
    }
}

/// Result code carried in every reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ResultCode {
    Ok = 0,
    PortAlreadyExists = 1,
    UnknownAction = 2,
    CannotRegisterDevice = 3,
    NoSuchDevice = 4,
    DeviceBusy = 5,
    NoMemory = 6,
}

impl ResultCode {
    pub fn is_ok(&self) -> bool {
        *self == ResultCode::Ok
    }
}

impl TryFrom<u32> for ResultCode {
    type Error = DecodeError;

    fn try_from(raw: u32) -> Result<Self, Self::Error> {
        match raw {
            0 => Ok(ResultCode::Ok),
            1 => Ok(ResultCode::PortAlreadyExists),
            2 => Ok(ResultCode::UnknownAction),
            3 => Ok(ResultCode::CannotRegisterDevice),
            4 => Ok(ResultCode::NoSuchDevice),
            5 => Ok(ResultCode::DeviceBusy),
            6 => Ok(ResultCode::NoMemory),
            other => Err(DecodeError::UnknownResult(other)),
        }
    }
}

impl From<&PortError> for ResultCode {
    fn from(err: &PortError) -> Self {
        match err {
            PortError::AlreadyExists(_) => ResultCode::PortAlreadyExists,
            PortError::CannotRegister { .. } => ResultCode::CannotRegisterDevice,
            PortError::NoSuchDevice(_) => ResultCode::NoSuchDevice,
            PortError::DeviceBusy(_) => ResultCode::DeviceBusy,
            PortError::NoMemory(_) => ResultCode::NoMemory,
        }
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResultCode::Ok => "ok",
            ResultCode::PortAlreadyExists => "port already exists",
            ResultCode::UnknownAction => "unknown action",
            ResultCode::CannotRegisterDevice => "cannot register device",
            ResultCode::NoSuchDevice => "no such device",
            ResultCode::DeviceBusy => "device busy",
            ResultCode::NoMemory => "out of memory",
        };
        f.write_str(s)
    }
}

/// Wire decode failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("Datagram too short: {len} bytes, need {need}")]
    Truncated { len: usize, need: usize },

    #[error("Unknown action {0}")]
    UnknownAction(u32),

    #[error("Unknown result code {0}")]
    UnknownResult(u32),
}

/// A decoded control request.
///
/// Names are kept as sent; validation is left to the hosting environment so
/// that an unrepresentable name is reported as `CannotRegisterDevice`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub action: Action,
    pub ports: [String; 2],
}

impl Request {
    /// Build a request from unvalidated names.
    pub fn new(action: Action, first: &str, second: &str) -> Self {
        Request {
            action,
            ports: [first.to_string(), second.to_string()],
        }
    }

    pub fn add(name: &PortName) -> Self {
        Self::single(Action::Add, name)
    }

    pub fn remove(name: &PortName) -> Self {
        Self::single(Action::Remove, name)
    }

    pub fn connect(a: &PortName, b: &PortName) -> Self {
        Request {
            action: Action::Connect,
            ports: [a.to_string(), b.to_string()],
        }
    }

    pub fn disconnect(name: &PortName) -> Self {
        Self::single(Action::Disconnect, name)
    }

    pub fn dump(name: &PortName) -> Self {
        Self::single(Action::Dump, name)
    }

    fn single(action: Action, name: &PortName) -> Self {
        Request {
            action,
            ports: [name.to_string(), String::new()],
        }
    }

    /// Encode into the fixed wire layout.
    ///
    /// Fails if a name does not fit its 16-byte field.
    pub fn encode(&self) -> Result<[u8; REQUEST_LEN], NameError> {
        let mut buf = [0u8; REQUEST_LEN];
        buf[..4].copy_from_slice(&(self.action as u32).to_ne_bytes());
        for (i, port) in self.ports.iter().enumerate() {
            let field = &mut buf[4 + i * NAME_SIZE..4 + (i + 1) * NAME_SIZE];
            write_name(field, port)?;
        }
        Ok(buf)
    }

    /// Decode a request datagram. Trailing bytes are ignored.
    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        if buf.len() < REQUEST_LEN {
            return Err(DecodeError::Truncated {
                len: buf.len(),
                need: REQUEST_LEN,
            });
        }
        let action = Action::try_from(read_u32(buf))?;
        let ports = [
            read_name(&buf[4..4 + NAME_SIZE]),
            read_name(&buf[4 + NAME_SIZE..REQUEST_LEN]),
        ];
        Ok(Request { action, ports })
    }
}

/// A control reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub result: ResultCode,
    /// Peer name for a successful dump, empty otherwise
    pub port: String,
}

impl Reply {
    pub fn ok() -> Self {
        Self::with_code(ResultCode::Ok)
    }

    pub fn ok_with_peer(peer: Option<&PortName>) -> Self {
        Reply {
            result: ResultCode::Ok,
            port: peer.map(|p| p.to_string()).unwrap_or_default(),
        }
    }

    pub fn with_code(result: ResultCode) -> Self {
        Reply {
            result,
            port: String::new(),
        }
    }

    pub fn error(err: &PortError) -> Self {
        Self::with_code(ResultCode::from(err))
    }

    /// Encode into the fixed wire layout.
    ///
    /// A port name that does not fit is cut to its field, which cannot happen
    /// for names that passed validation.
    pub fn encode(&self) -> [u8; REPLY_LEN] {
        let mut buf = [0u8; REPLY_LEN];
        buf[..4].copy_from_slice(&(self.result as u32).to_ne_bytes());
        let name = self.port.as_bytes();
        let len = name.len().min(NAME_SIZE - 1);
        buf[4..4 + len].copy_from_slice(&name[..len]);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        if buf.len() < REPLY_LEN {
            return Err(DecodeError::Truncated {
                len: buf.len(),
                need: REPLY_LEN,
            });
        }
        let result = ResultCode::try_from(read_u32(buf))?;
        Ok(Reply {
            result,
            port: read_name(&buf[4..REPLY_LEN]),
        })
    }
}

/// Check that a name fits its wire field.
///
/// This is the only check made before sending; everything else about a name
/// is judged by the daemon.
pub fn check_name(name: &str) -> Result<(), NameError> {
    if name.len() > MAX_NAME_LEN {
        return Err(NameError::TooLong(name.len()));
    }
    Ok(())
}

fn read_u32(buf: &[u8]) -> u32 {
    u32::from_ne_bytes([buf[0], buf[1], buf[2], buf[3]])
}

/// Read a NUL-padded name field, up to the first NUL.
fn read_name(field: &[u8]) -> String {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).into_owned()
}

fn write_name(field: &mut [u8], name: &str) -> Result<(), NameError> {
    let bytes = name.as_bytes();
    if bytes.len() >= field.len() {
        return Err(NameError::TooLong(bytes.len()));
    }
    field[..bytes.len()].copy_from_slice(bytes);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(s: &str) -> PortName {
        PortName::new(s).unwrap()
    }

    #[test]
    fn test_request_layout() {
        let buf = Request::connect(&name("veth0"), &name("veth1"))
            .encode()
            .unwrap();

        assert_eq!(buf.len(), 36);
        assert_eq!(&buf[..4], &2u32.to_ne_bytes());
        assert_eq!(&buf[4..9], b"veth0");
        assert!(buf[9..20].iter().all(|&b| b == 0));
        assert_eq!(&buf[20..25], b"veth1");
        assert!(buf[25..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_request_decode() {
        let mut buf = [0u8; REQUEST_LEN];
        buf[..4].copy_from_slice(&4u32.to_ne_bytes());
        buf[4..8].copy_from_slice(b"tap0");

        let request = Request::decode(&buf).unwrap();
        assert_eq!(request.action, Action::Dump);
        assert_eq!(request.ports[0], "tap0");
        assert_eq!(request.ports[1], "");
    }

    #[test]
    fn test_request_decode_ignores_trailing_bytes() {
        let mut buf = Request::add(&name("a")).encode().unwrap().to_vec();
        buf.extend_from_slice(&[0xff; 8]);
        assert_eq!(Request::decode(&buf).unwrap(), Request::add(&name("a")));
    }

    #[test]
    fn test_request_decode_errors() {
        assert_eq!(
            Request::decode(&[0u8; 10]),
            Err(DecodeError::Truncated { len: 10, need: 36 })
        );

        let mut buf = [0u8; REQUEST_LEN];
        buf[..4].copy_from_slice(&5u32.to_ne_bytes());
        assert_eq!(Request::decode(&buf), Err(DecodeError::UnknownAction(5)));

        buf[..4].copy_from_slice(&u32::MAX.to_ne_bytes());
        assert_eq!(
            Request::decode(&buf),
            Err(DecodeError::UnknownAction(u32::MAX))
        );
    }

    #[test]
    fn test_request_unterminated_name() {
        // a full 16-byte field without NUL is taken as is
        let mut buf = [0u8; REQUEST_LEN];
        buf[4..20].copy_from_slice(b"abcdefghijklmnop");
        let request = Request::decode(&buf).unwrap();
        assert_eq!(request.ports[0], "abcdefghijklmnop");
    }

    #[test]
    fn test_request_encode_rejects_long_name() {
        let request = Request {
            action: Action::Add,
            ports: ["abcdefghijklmnop".to_string(), String::new()],
        };
        assert_eq!(request.encode(), Err(NameError::TooLong(16)));
    }

    #[test]
    fn test_check_name() {
        assert!(check_name("abcdefghijklmno").is_ok());
        // judged by the daemon, not here
        assert!(check_name("a/b").is_ok());
        assert_eq!(
            check_name("abcdefghijklmnop"),
            Err(NameError::TooLong(16))
        );
    }

    #[test]
    fn test_reply_layout() {
        let buf = Reply::ok_with_peer(Some(&name("veth1"))).encode();
        assert_eq!(buf.len(), 20);
        assert_eq!(&buf[..4], &0u32.to_ne_bytes());
        assert_eq!(&buf[4..9], b"veth1");
        assert!(buf[9..].iter().all(|&b| b == 0));

        let buf = Reply::with_code(ResultCode::DeviceBusy).encode();
        assert_eq!(&buf[..4], &5u32.to_ne_bytes());
        assert!(buf[4..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_reply_decode() {
        let reply = Reply::decode(&Reply::ok_with_peer(None).encode()).unwrap();
        assert_eq!(reply, Reply::ok());

        let mut buf = [0u8; REPLY_LEN];
        buf[..4].copy_from_slice(&7u32.to_ne_bytes());
        assert_eq!(Reply::decode(&buf), Err(DecodeError::UnknownResult(7)));
        assert!(matches!(
            Reply::decode(&buf[..3]),
            Err(DecodeError::Truncated { .. })
        ));
    }

    #[test]
    fn test_result_codes_from_errors() {
        use crate::host::HostError;

        let cases = [
            (PortError::AlreadyExists("a".into()), ResultCode::PortAlreadyExists, 1),
            (
                PortError::CannotRegister {
                    name: "a".into(),
                    source: HostError::Refused("a".into()),
                },
                ResultCode::CannotRegisterDevice,
                3,
            ),
            (PortError::NoSuchDevice("a".into()), ResultCode::NoSuchDevice, 4),
            (PortError::DeviceBusy("a".into()), ResultCode::DeviceBusy, 5),
            (PortError::NoMemory("a".into()), ResultCode::NoMemory, 6),
        ];
        for (err, code, raw) in cases {
            assert_eq!(ResultCode::from(&err), code);
            assert_eq!(code as u32, raw);
        }
        assert_eq!(ResultCode::UnknownAction as u32, 2);
    }
}
