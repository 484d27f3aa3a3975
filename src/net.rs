//! Socket helpers shared by discovery and fetch.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

use tokio::net::{TcpSocket, TcpStream, UdpSocket};

use crate::interface::{InterfaceBinder, SelectedInterface};

/// `ENODEV`: the interface named in `SO_BINDTODEVICE` does not exist.
const ENODEV: i32 = 19;

/// Returns `true` for errors meaning "this interface cannot reach the peer".
///
/// These trigger a switch to the next interface instead of a plain retry.
pub(crate) fn is_unreachable(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::NetworkUnreachable
            | io::ErrorKind::HostUnreachable
            | io::ErrorKind::NetworkDown
            | io::ErrorKind::AddrNotAvailable
    ) || err.raw_os_error() == Some(ENODEV)
}

/// Wraps a bind failure so it is classified as unreachable: a socket that cannot be
/// bound to the selected interface cannot use it.
fn bind_failure(err: io::Error, iface: &SelectedInterface) -> io::Error {
    if is_unreachable(&err) {
        return err;
    }
    io::Error::new(
        io::ErrorKind::NetworkUnreachable,
        format!("cannot bind to {iface}: {err}"),
    )
}

/// Opens a TCP connection to `addr` through `iface`.
pub(crate) async fn connect_tcp(
    binder: &dyn InterfaceBinder,
    iface: &SelectedInterface,
    addr: SocketAddr,
) -> io::Result<TcpStream> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    binder
        .bind_tcp(&socket, iface)
        .map_err(|e| bind_failure(e, iface))?;
    socket.connect(addr).await
}

/// Opens a UDP socket connected to `addr` through `iface`.
pub(crate) async fn connect_udp(
    binder: &dyn InterfaceBinder,
    iface: &SelectedInterface,
    addr: SocketAddr,
) -> io::Result<UdpSocket> {
    let local: SocketAddr = if addr.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    };
    let socket = UdpSocket::bind(local).await?;
    binder
        .bind_udp(&socket, iface)
        .map_err(|e| bind_failure(e, iface))?;
    socket.connect(addr).await?;
    Ok(socket)
}
