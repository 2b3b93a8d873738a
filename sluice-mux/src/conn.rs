use std::io;
use std::net::TcpStream;
use std::sync::Arc;

/// A byte-stream endpoint usable from several threads at once: one thread
/// may sit in `read` while others call `write_all`. This is the seam between
/// the multiplexer, the session layer underneath it, the filters that wrap
/// it, and the upstream sockets a pipe joins it to.
pub trait Conn: Send + Sync {
    /// Reads some bytes; `Ok(0)` is end-of-stream.
    fn read(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Writes the whole buffer.
    fn write_all(&self, buf: &[u8]) -> io::Result<()>;

    /// Tears the endpoint down; blocked readers and writers return.
    fn close(&self);
}

impl Conn for sluice_net::Session {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        match sluice_net::Session::read(self, buf) {
            Ok(n) => Ok(n),
            // A closed conversation is plain end-of-stream to the layers
            // above.
            Err(sluice_net::NetError::ClosedPipe) => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    fn write_all(&self, buf: &[u8]) -> io::Result<()> {
        sluice_net::Session::write(self, buf).map(|_| ()).map_err(Into::into)
    }

    fn close(&self) {
        let _ = sluice_net::Session::close(self);
    }
}

impl Conn for TcpStream {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        io::Read::read(&mut &*self, buf)
    }

    fn write_all(&self, buf: &[u8]) -> io::Result<()> {
        io::Write::write_all(&mut &*self, buf)
    }

    fn close(&self) {
        let _ = self.shutdown(std::net::Shutdown::Both);
    }
}

#[cfg(unix)]
impl Conn for std::os::unix::net::UnixStream {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        io::Read::read(&mut &*self, buf)
    }

    fn write_all(&self, buf: &[u8]) -> io::Result<()> {
        io::Write::write_all(&mut &*self, buf)
    }

    fn close(&self) {
        let _ = self.shutdown(std::net::Shutdown::Both);
    }
}

impl<T: Conn + ?Sized> Conn for Arc<T> {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        (**self).read(buf)
    }

    fn write_all(&self, buf: &[u8]) -> io::Result<()> {
        (**self).write_all(buf)
    }

    fn close(&self) {
        (**self).close()
    }
}
