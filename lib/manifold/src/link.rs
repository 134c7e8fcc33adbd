use crate::config::LineSettings;
use std::io;
use std::time::Duration;

/// Byte transport underneath a port driver. Implementations must report an
/// idle read window as `io::ErrorKind::TimedOut` (or `WouldBlock`) so the
/// receive worker can keep cycling, and a torn down transport as any other
/// error kind.
pub trait Link: io::Read + io::Write + Send {
    /// A second handle onto the same transport, used to split the receive
    /// worker off from the write path.
    fn try_clone(&self) -> io::Result<Box<dyn Link>>;
}

/// Builds a fresh link. The gate keeps the factory around so a port can be
/// rebuilt after a fatal transport error.
pub type LinkFactory = Box<dyn Fn() -> io::Result<Box<dyn Link>> + Send + Sync>;

/// A `Link` over a physical serial port.
pub struct SerialLink {
    port: Box<dyn serialport::SerialPort>,
}

impl SerialLink {
    /// Opens the device with the configured line parameters. The byte
    /// timeout bounds a single blocking read in the receive worker.
    pub fn open(path: &str, settings: &LineSettings) -> io::Result<SerialLink> {
        let port = serialport::new(path, settings.baud)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .timeout(Duration::from_millis(settings.byte_timeout_ms))
            .open()
            .map_err(io::Error::from)?;

        Ok(SerialLink { port })
    }

    /// A factory reopening the same device, for port recreation.
    pub fn factory(path: &str, settings: &LineSettings) -> LinkFactory {
        let path = path.to_string();
        let settings = settings.clone();

        Box::new(move || {
            SerialLink::open(&path, &settings).map(|link| Box::new(link) as Box<dyn Link>)
        })
    }
}

impl io::Read for SerialLink {
    #[inline]
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.port.read(buf)
    }
}

impl io::Write for SerialLink {
    #[inline]
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.port.write(buf)
    }

    #[inline]
    fn flush(&mut self) -> io::Result<()> {
        self.port.flush()
    }
}

impl Link for SerialLink {
    fn try_clone(&self) -> io::Result<Box<dyn Link>> {
        let port = self.port.try_clone().map_err(io::Error::from)?;
        Ok(Box::new(SerialLink { port }))
    }
}
