//! UDP discovery socket construction. Tuya gateways broadcast `UDP_NEW`
//! (and, on newer firmware, an encrypted `UDP_NEW` variant on a second
//! port) frames on the LAN; listening for them needs `SO_REUSEADDR` (other
//! local tools, or a restarted instance of this one, may already hold the
//! port) and a broadcast-capable, unconnected socket — the same `socket2`
//! construction `hdds-team-hdds`'s UDP transport uses before handing the
//! raw fd to its own I/O layer.

use mio::net::UdpSocket as MioUdpSocket;
use socket2::{Domain, Socket, Type};
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

pub fn bind_discovery(port: u16) -> io::Result<MioUdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, None)?;
    socket.set_reuse_address(true)?;
    socket.set_broadcast(true)?;
    socket.set_nonblocking(true)?;

    let addr: SocketAddr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port).into();
    socket.bind(&addr.into())?;

    let std_socket: std::net::UdpSocket = socket.into();
    Ok(MioUdpSocket::from_std(std_socket))
}
