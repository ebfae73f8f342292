//! Linux TAP hosting environment.
//!
//! Every port becomes a TAP interface created through `/dev/net/tun`. The
//! interface is brought administratively up at registration and its carrier
//! follows the link state via `TUNSETCARRIER`. A pump thread per device reads
//! frames the kernel transmits on the interface and submits them to the
//! forwarding engine; frames for the port are written back to the same fd.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::fs::OpenOptionsExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;

use arc_swap::ArcSwapOption;
use crossbeam_channel::TrySendError;
use nix::errno::Errno;
use nix::libc::{self, IFF_NO_PI, IFF_TAP, IFNAMSIZ, c_char, c_int, c_short};
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use tracing::{debug, info, trace, warn};

use super::{HostDevice, HostEnvironment, HostError, Result};
use crate::forward::{Frame, Transmit, TransmitSender};
use crate::port::{PortId, PortName};

const TUNSETIFF: libc::Ioctl = 0x400454ca as libc::Ioctl;
const TUNSETCARRIER: libc::Ioctl = 0x400454e2 as libc::Ioctl;

/// Largest frame read from a TAP fd.
const MAX_FRAME_SIZE: usize = 65536;

/// How often the pump thread checks its stop flag.
const PUMP_POLL_MS: u16 = 100;

#[repr(C)]
struct IfReq {
    ifr_name: [c_char; IFNAMSIZ],
    ifr_flags: c_short,
    _padding: [u8; 22],
}

/// Hosting environment backed by kernel TAP devices.
pub struct TapHost {
    transmit: TransmitSender,
}

impl TapHost {
    pub fn new(transmit: TransmitSender) -> Self {
        Self { transmit }
    }
}

impl HostEnvironment for TapHost {
    fn register(&self, id: PortId, name: &PortName) -> Result<Arc<dyn HostDevice>> {
        let file = open_tap(name)?;
        set_carrier_fd(&file, false)?;
        set_interface_up(name)?;

        let file = Arc::new(file);
        let stop = Arc::new(AtomicBool::new(false));

        let pump = {
            let file = Arc::clone(&file);
            let stop = Arc::clone(&stop);
            let tx = self.transmit.clone();
            let name = name.clone();
            std::thread::Builder::new()
                .name(format!("tap-{name}"))
                .spawn(move || run_pump(id, &name, &file, &stop, &tx))?
        };

        info!(port = %name, id = %id, "TAP device created");
        Ok(Arc::new(TapDevice {
            name: name.clone(),
            file: ArcSwapOption::from(Some(file)),
            stop,
            pump: Mutex::new(Some(pump)),
        }))
    }
}

/// A TAP interface backing one port.
pub struct TapDevice {
    name: PortName,
    /// `None` once unregistered
    file: ArcSwapOption<File>,
    stop: Arc<AtomicBool>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl TapDevice {
    pub fn name(&self) -> &PortName {
        &self.name
    }
}

impl HostDevice for TapDevice {
    fn set_carrier(&self, up: bool) -> Result<()> {
        let file = self
            .file
            .load_full()
            .ok_or_else(|| HostError::NotRegistered(self.name.to_string()))?;
        set_carrier_fd(&file, up)?;
        debug!(port = %self.name, up, "Carrier changed");
        Ok(())
    }

    fn deliver(&self, frame: Frame) -> Result<()> {
        let guard = self.file.load();
        let Some(file) = guard.as_ref() else {
            return Err(HostError::NotRegistered(self.name.to_string()));
        };
        (&**file).write_all(frame.as_slice())?;
        Ok(())
    }

    fn unregister(&self) -> Result<()> {
        self.stop.store(true, Ordering::SeqCst);
        let pump = self
            .pump
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = pump {
            let _ = handle.join();
        }
        // Closing the last fd destroys the interface.
        if self.file.swap(None).is_none() {
            return Err(HostError::NotRegistered(self.name.to_string()));
        }
        info!(port = %self.name, "TAP device removed");
        Ok(())
    }
}

impl Drop for TapDevice {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}

fn open_tap(name: &PortName) -> io::Result<File> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_NONBLOCK)
        .open("/dev/net/tun")?;

    let mut ifr = IfReq {
        ifr_name: [0; IFNAMSIZ],
        ifr_flags: (IFF_TAP | IFF_NO_PI) as c_short,
        _padding: [0; 22],
    };
    for (slot, byte) in ifr.ifr_name.iter_mut().zip(name.as_str().bytes()) {
        *slot = byte as c_char;
    }

    // SAFETY: ifr is a valid, initialised ifreq-compatible buffer that outlives the call.
    let result = unsafe { libc::ioctl(file.as_raw_fd(), TUNSETIFF, &ifr) };
    if result < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(file)
}

fn set_carrier_fd(file: &File, up: bool) -> io::Result<()> {
    let carrier: c_int = up.into();
    // SAFETY: TUNSETCARRIER reads one int through the pointer.
    let result = unsafe { libc::ioctl(file.as_raw_fd(), TUNSETCARRIER, &carrier) };
    if result < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Set IFF_UP on an interface by name.
fn set_interface_up(name: &PortName) -> io::Result<()> {
    // SAFETY: plain socket(2) call; the fd is owned right away.
    let raw = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM | libc::SOCK_CLOEXEC, 0) };
    if raw < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: raw is a fresh fd nobody else owns.
    let sock = unsafe { OwnedFd::from_raw_fd(raw) };

    // SAFETY: ifreq is plain old data; all-zero is a valid value.
    let mut ifreq: libc::ifreq = unsafe { std::mem::zeroed() };
    for (slot, byte) in ifreq.ifr_name.iter_mut().zip(name.as_str().bytes()) {
        *slot = byte as c_char;
    }

    // SAFETY: ifreq is valid for reads and writes for the duration of the call.
    let result = unsafe {
        libc::ioctl(
            sock.as_raw_fd(),
            libc::SIOCGIFFLAGS as libc::Ioctl,
            &mut ifreq,
        )
    };
    if result < 0 {
        return Err(io::Error::last_os_error());
    }

    // SAFETY: SIOCGIFFLAGS filled in the flags member of the union.
    unsafe {
        ifreq.ifr_ifru.ifru_flags |= libc::IFF_UP as c_short;
    }

    // SAFETY: as above.
    let result =
        unsafe { libc::ioctl(sock.as_raw_fd(), libc::SIOCSIFFLAGS as libc::Ioctl, &ifreq) };
    if result < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Read frames the kernel sends out of the interface and hand them to the engine.
fn run_pump(id: PortId, name: &PortName, file: &File, stop: &AtomicBool, tx: &TransmitSender) {
    let mut buf = vec![0u8; MAX_FRAME_SIZE];

    while !stop.load(Ordering::SeqCst) {
        let mut fds = [PollFd::new(file.as_fd(), PollFlags::POLLIN)];
        match poll(&mut fds, PollTimeout::from(PUMP_POLL_MS)) {
            Ok(0) | Err(Errno::EINTR) => continue,
            Ok(_) => {}
            Err(e) => {
                warn!(port = %name, error = %e, "Poll failed, stopping pump");
                break;
            }
        }

        loop {
            let len = match (&*file).read(&mut buf) {
                Ok(0) => break,
                Ok(len) => len,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(port = %name, error = %e, "Read failed, stopping pump");
                    return;
                }
            };

            let frame = Frame::from(&buf[..len]);
            match tx.try_send(Transmit { port: id, frame }) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    trace!(port = %name, "Transmit queue full, frame dropped")
                }
                Err(TrySendError::Disconnected(_)) => {
                    debug!(port = %name, "Forwarding engine gone, stopping pump");
                    return;
                }
            }
        }
    }
    debug!(port = %name, "Pump stopped");
}
