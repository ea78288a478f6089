use color_eyre::{eyre, Result};
use nix::poll::{PollFd, PollFlags};
use std::ffi::{c_int, CString};
use std::io;
use std::mem::MaybeUninit;
use std::path::Path;
use std::ptr;
use std::slice;
use std::time::Duration;

#[derive(Debug, Copy, Clone)]
pub enum ClearBuffer {
    Input,
    Output,
    All,
}

/// A raw serial port: noncanonical mode, 8 data bits, 1 stop bit, no
/// parity, no flow control. Reads time out after `default_timeout`; the
/// word-level read path retries on timeout, since the peer may take
/// arbitrarily long to respond.
pub struct Tty {
    fd: c_int,
    default_timeout: Duration,
}

impl Tty {
    pub fn new<P: AsRef<Path>>(path: P, baud: u32) -> Result<Self> {
        let path_cstr = CString::new(path.as_ref().as_os_str().as_encoded_bytes()).unwrap();
        let fd = unsafe {
            libc::open(
                path_cstr.as_ptr(),
                // readwrite, no controlling terminal, sync, close-on-exec,
                // don't block on open or for data to become available
                libc::O_RDWR | libc::O_NOCTTY | libc::O_SYNC | libc::O_CLOEXEC | libc::O_NONBLOCK,
            )
        };
        if fd < 0 {
            eyre::bail!(
                "failed to open {}: {}",
                path.as_ref().display(),
                io::Error::last_os_error()
            );
        }
        let mut this = Self {
            fd,
            default_timeout: Duration::new(0, 0),
        };
        this.configure(baud)?;
        Ok(this)
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.default_timeout = timeout;
    }

    pub fn clear(&mut self, cb: ClearBuffer) -> Result<()> {
        let r = match cb {
            ClearBuffer::Input => unsafe { libc::tcflush(self.fd, libc::TCIFLUSH) },
            ClearBuffer::Output => unsafe { libc::tcflush(self.fd, libc::TCOFLUSH) },
            ClearBuffer::All => unsafe { libc::tcflush(self.fd, libc::TCIOFLUSH) },
        };
        if r == -1 {
            Err(nix::errno::Errno::last().into())
        } else {
            Ok(())
        }
    }

    fn configure(&mut self, baud: u32) -> Result<()> {
        let mut tios = unsafe {
            let mut tios = MaybeUninit::uninit();
            let r = libc::tcgetattr(self.fd, tios.as_mut_ptr());
            if r != 0 {
                eyre::bail!("failed to tcgetattr: {}", nix::errno::Errno::last());
            }
            tios.assume_init()
        };

        // ignore breaks, no XON/XOFF flow control in either direction,
        // noncanonical input
        tios.c_iflag |= libc::IGNBRK;
        tios.c_iflag &= !(libc::IXON | libc::IXOFF | libc::IXANY);
        tios.c_iflag &= !(libc::ICANON | libc::ECHO | libc::ECHOE | libc::ISIG);

        // no output processing
        tios.c_oflag = 0;

        // 8N1, no hardware flow control, receiver on, modem lines ignored
        tios.c_cflag &= !libc::CSIZE;
        tios.c_cflag |= libc::CS8;
        tios.c_cflag &= !libc::PARENB;
        tios.c_cflag &= !libc::CSTOPB;
        tios.c_cflag &= !libc::CRTSCTS;
        tios.c_cflag |= libc::CREAD | libc::CLOCAL;

        // no local modes
        tios.c_lflag = 0;

        // MIN=0 TIME=0: read returns whatever is available without waiting
        tios.c_cc[libc::VMIN] = 0;
        tios.c_cc[libc::VTIME] = 0;

        let speed = speed_for(baud)
            .ok_or_else(|| eyre::eyre!("unsupported baud rate {baud} for this port"))?;
        unsafe {
            if libc::cfsetspeed(&mut tios, speed) != 0 {
                eyre::bail!("failed to cfsetspeed: {}", nix::errno::Errno::last());
            }
            if libc::tcsetattr(self.fd, libc::TCSADRAIN, ptr::addr_of!(tios)) != 0 {
                eyre::bail!("failed to tcsetattr: {}", nix::errno::Errno::last());
            }
        }
        Ok(())
    }

    fn can_write(&mut self) -> io::Result<()> {
        let mut fd = PollFd::new(self.fd, PollFlags::POLLOUT);

        // poll takes -1 for an indefinite block
        let wait = nix::poll::poll(slice::from_mut(&mut fd), -1).map_err(io::Error::from)?;
        if wait != 1 {
            return Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "poll() returned no writable fd",
            ));
        }
        match fd.revents() {
            Some(e) if e == PollFlags::POLLOUT => Ok(()),
            Some(e) if e.contains(PollFlags::POLLHUP) || e.contains(PollFlags::POLLNVAL) => Err(
                io::Error::new(io::ErrorKind::BrokenPipe, "serial port hung up"),
            ),
            _ => Err(io::Error::new(
                io::ErrorKind::Other,
                "unexpected poll() events",
            )),
        }
    }

    fn can_read_timeout(&mut self, t: Duration) -> io::Result<bool> {
        let mut rfds = unsafe {
            let mut rfds = MaybeUninit::uninit();
            libc::FD_ZERO(rfds.as_mut_ptr());
            libc::FD_SET(self.fd, rfds.as_mut_ptr());
            rfds.assume_init()
        };
        let mut timeval = libc::timeval {
            tv_sec: t.as_secs() as libc::time_t,
            tv_usec: t.subsec_micros() as libc::suseconds_t,
        };
        let r = unsafe {
            libc::select(
                self.fd + 1,
                ptr::addr_of_mut!(rfds),
                ptr::null_mut(),
                ptr::null_mut(),
                ptr::addr_of_mut!(timeval),
            )
        };
        if r < 0 {
            Err(nix::errno::Errno::last().into())
        } else {
            Ok(unsafe { libc::FD_ISSET(self.fd, ptr::addr_of!(rfds)) })
        }
    }
}

impl io::Read for Tty {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if !self.can_read_timeout(self.default_timeout)? {
            return Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "read from serial port timed out",
            ));
        }
        let n = unsafe { libc::read(self.fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if n == -1 {
            Err(nix::errno::Errno::last().into())
        } else {
            Ok(n as usize)
        }
    }
}

impl io::Write for Tty {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.can_write()?;
        let n = unsafe { libc::write(self.fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
        if n == -1 {
            if nix::errno::errno() == libc::EAGAIN {
                Err(io::Error::new(
                    io::ErrorKind::WouldBlock,
                    "write() would block",
                ))
            } else {
                Err(nix::errno::Errno::last().into())
            }
        } else if n == 0 {
            Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "write() returned 0",
            ))
        } else {
            Ok(n as usize)
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        let r = unsafe { libc::tcdrain(self.fd) };
        if r == -1 {
            Err(nix::errno::Errno::last().into())
        } else {
            Ok(())
        }
    }
}

impl Drop for Tty {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

fn speed_for(baud: u32) -> Option<libc::speed_t> {
    Some(match baud {
        9_600 => libc::B9600,
        19_200 => libc::B19200,
        38_400 => libc::B38400,
        57_600 => libc::B57600,
        115_200 => libc::B115200,
        230_400 => libc::B230400,
        _ => return None,
    })
}
