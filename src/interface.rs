//! Interface selection and socket binding.
//!
//! [`InterfaceSelector`] walks the configured interfaces from cheapest to most expensive.
//! [`InterfaceBinder`] is the capability "bind this outbound socket to that interface";
//! discovery and fetch call it for every socket they open.

use std::fmt;
use std::io;

use tokio::net::{TcpSocket, UdpSocket};

use crate::config::Interface;

/// The interface an attempt runs on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectedInterface {
    /// A configured interface.
    Named(Interface),
    /// No interface configured: let the OS pick the route.
    Default,
}

impl SelectedInterface {
    /// Interface name, or `None` for the default route.
    pub fn name(&self) -> Option<&str> {
        match self {
            Self::Named(iface) => Some(&iface.name),
            Self::Default => None,
        }
    }
}

impl fmt::Display for SelectedInterface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Named(iface) => write!(f, "{} (cost {})", iface.name, iface.cost),
            Self::Default => f.write_str("default route"),
        }
    }
}

/// Cursor over interfaces in ascending cost order.
///
/// Equal costs keep their configuration order. An empty list yields
/// [`SelectedInterface::Default`] once.
#[derive(Debug, Clone)]
pub struct InterfaceSelector {
    ordered: Vec<Interface>,
    cursor: usize,
}

impl InterfaceSelector {
    /// Creates a selector over `interfaces`.
    pub fn new(interfaces: &[Interface]) -> Self {
        let mut ordered = interfaces.to_vec();
        ordered.sort_by_key(|iface| iface.cost);
        Self { ordered, cursor: 0 }
    }

    /// Number of entries the selector yields before it is exhausted.
    pub fn len(&self) -> usize {
        self.ordered.len().max(1)
    }

    /// Always `false`: an empty configuration still yields the default route.
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Returns `true` once every entry has been yielded.
    pub fn is_exhausted(&self) -> bool {
        self.cursor >= self.len()
    }

    /// Returns the most recently yielded entry.
    pub fn current(&self) -> Option<SelectedInterface> {
        self.cursor.checked_sub(1).and_then(|i| self.entry(i))
    }

    /// Rewinds to the cheapest interface.
    pub fn reset(&mut self) {
        self.cursor = 0;
    }

    fn entry(&self, index: usize) -> Option<SelectedInterface> {
        if self.ordered.is_empty() {
            return (index == 0).then_some(SelectedInterface::Default);
        }
        self.ordered.get(index).cloned().map(SelectedInterface::Named)
    }
}

impl Iterator for InterfaceSelector {
    type Item = SelectedInterface;

    fn next(&mut self) -> Option<Self::Item> {
        let item = self.entry(self.cursor)?;
        self.cursor += 1;
        Some(item)
    }
}

/// Binds outbound sockets to an interface.
///
/// Implementations must leave the socket untouched for [`SelectedInterface::Default`].
pub trait InterfaceBinder: Send + Sync + 'static {
    /// Binds a TCP socket before it connects.
    ///
    /// # Errors
    ///
    /// Returns the OS error if the socket cannot be bound.
    fn bind_tcp(&self, socket: &TcpSocket, iface: &SelectedInterface) -> io::Result<()>;

    /// Binds a UDP socket before it sends.
    ///
    /// # Errors
    ///
    /// Returns the OS error if the socket cannot be bound.
    fn bind_udp(&self, socket: &UdpSocket, iface: &SelectedInterface) -> io::Result<()>;
}

/// Binds sockets with `SO_BINDTODEVICE`.
///
/// Only available on Linux-like systems; elsewhere binding a named interface fails with
/// [`io::ErrorKind::Unsupported`].
#[derive(Debug, Clone, Copy, Default)]
pub struct DeviceBinder;

impl InterfaceBinder for DeviceBinder {
    fn bind_tcp(&self, socket: &TcpSocket, iface: &SelectedInterface) -> io::Result<()> {
        let Some(name) = iface.name() else {
            return Ok(());
        };

        #[cfg(any(target_os = "android", target_os = "fuchsia", target_os = "linux"))]
        {
            socket.bind_device(Some(name.as_bytes()))
        }

        #[cfg(not(any(target_os = "android", target_os = "fuchsia", target_os = "linux")))]
        {
            let _ = socket;
            Err(unsupported(name))
        }
    }

    fn bind_udp(&self, socket: &UdpSocket, iface: &SelectedInterface) -> io::Result<()> {
        let Some(name) = iface.name() else {
            return Ok(());
        };

        #[cfg(any(target_os = "android", target_os = "fuchsia", target_os = "linux"))]
        {
            socket.bind_device(Some(name.as_bytes()))
        }

        #[cfg(not(any(target_os = "android", target_os = "fuchsia", target_os = "linux")))]
        {
            let _ = socket;
            Err(unsupported(name))
        }
    }
}

#[cfg(not(any(target_os = "android", target_os = "fuchsia", target_os = "linux")))]
fn unsupported(name: &str) -> io::Error {
    io::Error::new(
        io::ErrorKind::Unsupported,
        format!("binding to interface {name} is not supported on this platform"),
    )
}

/// Leaves every socket on the default route, whatever interface is selected.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultRouteBinder;

impl InterfaceBinder for DefaultRouteBinder {
    fn bind_tcp(&self, _socket: &TcpSocket, _iface: &SelectedInterface) -> io::Result<()> {
        Ok(())
    }

    fn bind_udp(&self, _socket: &UdpSocket, _iface: &SelectedInterface) -> io::Result<()> {
        Ok(())
    }
}
