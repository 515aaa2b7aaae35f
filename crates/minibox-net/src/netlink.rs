//! Netlink socket operations for network configuration.
//!
//! A minimal rtnetlink client over a raw `AF_NETLINK` socket: enough to
//! create a veth pair, enslave one end to a bridge, move the other end
//! into a target network namespace, and assign an address inside it.

use std::ffi::CString;
use std::io;
use std::mem;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd};

use ipnetwork::IpNetwork;

use crate::error::{NetError, Result};

const NETLINK_ROUTE: i32 = 0;

// Netlink message types
const RTM_NEWLINK: u16 = 16;
const RTM_NEWADDR: u16 = 20;

// Netlink flags
const NLM_F_REQUEST: u16 = 0x0001;
const NLM_F_ACK: u16 = 0x0004;
const NLM_F_EXCL: u16 = 0x0200;
const NLM_F_CREATE: u16 = 0x0400;

const NLA_F_NESTED: u16 = 1 << 15;

// Interface flags
const IFF_UP: u32 = 0x1;

// Attribute types for RTM_NEWLINK
const IFLA_IFNAME: u16 = 3;
const IFLA_MASTER: u16 = 10;
const IFLA_LINKINFO: u16 = 18;
const IFLA_NET_NS_PID: u16 = 25;
const IFLA_INFO_KIND: u16 = 1;
const IFLA_INFO_DATA: u16 = 2;

// Nested under IFLA_INFO_DATA for kind "veth"
const VETH_INFO_PEER: u16 = 1;

// Attribute types for RTM_NEWADDR
const IFA_ADDRESS: u16 = 1;
const IFA_LOCAL: u16 = 2;

/// Netlink message header.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct NlMsgHdr {
    nlmsg_len: u32,
    nlmsg_type: u16,
    nlmsg_flags: u16,
    nlmsg_seq: u32,
    nlmsg_pid: u32,
}

/// Interface info message.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct IfInfoMsg {
    ifi_family: u8,
    _pad: u8,
    ifi_type: u16,
    ifi_index: i32,
    ifi_flags: u32,
    ifi_change: u32,
}

/// Interface address message.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct IfAddrMsg {
    ifa_family: u8,
    ifa_prefixlen: u8,
    ifa_flags: u8,
    ifa_scope: u8,
    ifa_index: u32,
}

/// Netlink attribute header.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct NlAttr {
    nla_len: u16,
    nla_type: u16,
}

/// Appends the raw bytes of a `#[repr(C)]` struct to a message buffer.
fn push_struct<T: Copy>(msg: &mut Vec<u8>, value: &T) {
    let bytes = unsafe {
        std::slice::from_raw_parts((value as *const T).cast::<u8>(), mem::size_of::<T>())
    };
    msg.extend_from_slice(bytes);
}

/// Netlink socket handle for network configuration.
pub struct NetlinkHandle {
    fd: OwnedFd,
    seq: u32,
}

impl NetlinkHandle {
    /// Creates and binds a new rtnetlink socket.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot be created or bound.
    pub fn new() -> Result<Self> {
        let fd = unsafe {
            libc::socket(
                libc::AF_NETLINK,
                libc::SOCK_RAW | libc::SOCK_CLOEXEC,
                NETLINK_ROUTE,
            )
        };
        if fd < 0 {
            return Err(NetError::Netlink(format!(
                "failed to create netlink socket: {}",
                io::Error::last_os_error()
            )));
        }

        let mut addr: libc::sockaddr_nl = unsafe { mem::zeroed() };
        addr.nl_family = libc::AF_NETLINK as u16;
        addr.nl_pid = 0; // kernel assigns
        addr.nl_groups = 0;
        let ret = unsafe {
            libc::bind(
                fd,
                std::ptr::addr_of!(addr).cast::<libc::sockaddr>(),
                mem::size_of::<libc::sockaddr_nl>() as u32,
            )
        };
        if ret < 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(NetError::Netlink(format!(
                "failed to bind netlink socket: {err}"
            )));
        }

        let fd = unsafe { OwnedFd::from_raw_fd(fd) };
        Ok(Self { fd, seq: 0 })
    }

    fn next_seq(&mut self) -> u32 {
        self.seq = self.seq.wrapping_add(1);
        self.seq
    }

    /// Sends a netlink message and waits for the kernel acknowledgement.
    fn send_and_ack(&mut self, msg: &[u8]) -> Result<()> {
        let sent = unsafe {
            libc::send(
                self.fd.as_raw_fd(),
                msg.as_ptr().cast::<libc::c_void>(),
                msg.len(),
                0,
            )
        };
        if sent < 0 {
            return Err(NetError::Netlink(format!(
                "failed to send netlink message: {}",
                io::Error::last_os_error()
            )));
        }

        let mut buf = [0u8; 4096];
        let len = unsafe {
            libc::recv(
                self.fd.as_raw_fd(),
                buf.as_mut_ptr().cast::<libc::c_void>(),
                buf.len(),
                0,
            )
        };
        if len < 0 {
            return Err(NetError::Netlink(format!(
                "failed to receive netlink response: {}",
                io::Error::last_os_error()
            )));
        }

        // An NLMSG_ERROR with a zero code is the requested ACK.
        if len >= mem::size_of::<NlMsgHdr>() as isize {
            let hdr = unsafe { &*buf.as_ptr().cast::<NlMsgHdr>() };
            if hdr.nlmsg_type == libc::NLMSG_ERROR as u16
                && len >= (mem::size_of::<NlMsgHdr>() + 4) as isize
            {
                let error_code = unsafe {
                    *buf.as_ptr().add(mem::size_of::<NlMsgHdr>()).cast::<i32>()
                };
                if error_code != 0 {
                    return Err(NetError::Netlink(format!(
                        "netlink error: {}",
                        io::Error::from_raw_os_error(-error_code)
                    )));
                }
            }
        }

        Ok(())
    }

    /// Finalizes the message header in place.
    fn finish_header(msg: &mut [u8], msg_type: u16, flags: u16, seq: u32) {
        let hdr = NlMsgHdr {
            nlmsg_len: msg.len() as u32,
            nlmsg_type: msg_type,
            nlmsg_flags: flags,
            nlmsg_seq: seq,
            nlmsg_pid: 0,
        };
        let bytes = unsafe {
            std::slice::from_raw_parts(
                std::ptr::addr_of!(hdr).cast::<u8>(),
                mem::size_of::<NlMsgHdr>(),
            )
        };
        msg[..mem::size_of::<NlMsgHdr>()].copy_from_slice(bytes);
    }

    /// Creates a veth pair with the given end names.
    ///
    /// Message shape: `RTM_NEWLINK` carrying `IFLA_IFNAME` plus a nested
    /// `IFLA_LINKINFO(IFLA_INFO_KIND "veth", IFLA_INFO_DATA(VETH_INFO_PEER))`
    /// where the peer block holds its own `ifinfomsg` and `IFLA_IFNAME`.
    ///
    /// # Errors
    ///
    /// Returns an error if the pair cannot be created (including when an
    /// interface with either name already exists).
    pub fn create_veth(&mut self, name: &str, peer: &str) -> Result<()> {
        let seq = self.next_seq();
        let mut msg = Vec::with_capacity(256);

        msg.extend_from_slice(&[0u8; mem::size_of::<NlMsgHdr>()]);
        push_struct(&mut msg, &IfInfoMsg::default());

        add_attr_string(&mut msg, IFLA_IFNAME, name);

        let linkinfo = begin_nested(&mut msg);
        add_attr_string(&mut msg, IFLA_INFO_KIND, "veth");

        let info_data = begin_nested(&mut msg);
        let peer_block = begin_nested(&mut msg);
        push_struct(&mut msg, &IfInfoMsg::default());
        add_attr_string(&mut msg, IFLA_IFNAME, peer);
        end_nested(&mut msg, peer_block, VETH_INFO_PEER);
        end_nested(&mut msg, info_data, IFLA_INFO_DATA);
        end_nested(&mut msg, linkinfo, IFLA_LINKINFO);

        Self::finish_header(
            &mut msg,
            RTM_NEWLINK,
            NLM_F_REQUEST | NLM_F_ACK | NLM_F_CREATE | NLM_F_EXCL,
            seq,
        );
        self.send_and_ack(&msg)
    }

    /// Sets interface state (up/down).
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be changed.
    pub fn set_link_state(&mut self, ifindex: u32, up: bool) -> Result<()> {
        let seq = self.next_seq();
        let mut msg = Vec::with_capacity(64);

        msg.extend_from_slice(&[0u8; mem::size_of::<NlMsgHdr>()]);
        push_struct(
            &mut msg,
            &IfInfoMsg {
                ifi_index: ifindex as i32,
                ifi_flags: if up { IFF_UP } else { 0 },
                ifi_change: IFF_UP,
                ..IfInfoMsg::default()
            },
        );

        Self::finish_header(&mut msg, RTM_NEWLINK, NLM_F_REQUEST | NLM_F_ACK, seq);
        self.send_and_ack(&msg)
    }

    /// Enslaves an interface to a master (bridge) by index.
    ///
    /// # Errors
    ///
    /// Returns an error if the master cannot be set.
    pub fn set_link_master(&mut self, ifindex: u32, master_ifindex: u32) -> Result<()> {
        let seq = self.next_seq();
        let mut msg = Vec::with_capacity(64);

        msg.extend_from_slice(&[0u8; mem::size_of::<NlMsgHdr>()]);
        push_struct(
            &mut msg,
            &IfInfoMsg {
                ifi_index: ifindex as i32,
                ..IfInfoMsg::default()
            },
        );
        add_attr_u32(&mut msg, IFLA_MASTER, master_ifindex);

        Self::finish_header(&mut msg, RTM_NEWLINK, NLM_F_REQUEST | NLM_F_ACK, seq);
        self.send_and_ack(&msg)
    }

    /// Moves an interface into the network namespace of `pid`.
    ///
    /// Moving clears the interface's configuration; the receiving
    /// namespace must bring it up and re-address it.
    ///
    /// # Errors
    ///
    /// Returns an error if the move fails.
    pub fn set_link_netns_pid(&mut self, ifindex: u32, pid: i32) -> Result<()> {
        let seq = self.next_seq();
        let mut msg = Vec::with_capacity(64);

        msg.extend_from_slice(&[0u8; mem::size_of::<NlMsgHdr>()]);
        push_struct(
            &mut msg,
            &IfInfoMsg {
                ifi_index: ifindex as i32,
                ..IfInfoMsg::default()
            },
        );
        add_attr_u32(&mut msg, IFLA_NET_NS_PID, pid as u32);

        Self::finish_header(&mut msg, RTM_NEWLINK, NLM_F_REQUEST | NLM_F_ACK, seq);
        self.send_and_ack(&msg)
    }

    /// Adds an IP address to an interface.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be added.
    pub fn add_address(&mut self, ifindex: u32, addr: IpNetwork) -> Result<()> {
        let seq = self.next_seq();
        let mut msg = Vec::with_capacity(64);

        msg.extend_from_slice(&[0u8; mem::size_of::<NlMsgHdr>()]);

        let family = match addr {
            IpNetwork::V4(_) => libc::AF_INET as u8,
            IpNetwork::V6(_) => libc::AF_INET6 as u8,
        };
        push_struct(
            &mut msg,
            &IfAddrMsg {
                ifa_family: family,
                ifa_prefixlen: addr.prefix(),
                ifa_flags: 0,
                ifa_scope: 0,
                ifa_index: ifindex,
            },
        );

        match addr {
            IpNetwork::V4(v4) => {
                let octets = v4.ip().octets();
                add_attr_bytes(&mut msg, IFA_LOCAL, &octets);
                add_attr_bytes(&mut msg, IFA_ADDRESS, &octets);
            }
            IpNetwork::V6(v6) => {
                let octets = v6.ip().octets();
                add_attr_bytes(&mut msg, IFA_LOCAL, &octets);
                add_attr_bytes(&mut msg, IFA_ADDRESS, &octets);
            }
        }

        Self::finish_header(
            &mut msg,
            RTM_NEWADDR,
            NLM_F_REQUEST | NLM_F_ACK | NLM_F_CREATE | NLM_F_EXCL,
            seq,
        );
        self.send_and_ack(&msg)
    }

    /// Looks up an interface index by name in the current namespace.
    ///
    /// # Errors
    ///
    /// Returns an error if the interface is not found.
    pub fn get_ifindex(&self, name: &str) -> Result<u32> {
        let c_name = CString::new(name).map_err(|e| NetError::Netlink(e.to_string()))?;
        let ifindex = unsafe { libc::if_nametoindex(c_name.as_ptr()) };
        if ifindex == 0 {
            return Err(NetError::Netlink(format!("interface not found: {name}")));
        }
        Ok(ifindex)
    }
}

/// Begins a nested attribute, returning the patch offset for [`end_nested`].
fn begin_nested(msg: &mut Vec<u8>) -> usize {
    let start = msg.len();
    msg.extend_from_slice(&[0u8; mem::size_of::<NlAttr>()]);
    start
}

/// Closes a nested attribute opened at `start`, patching its header.
fn end_nested(msg: &mut [u8], start: usize, attr_type: u16) {
    let attr = NlAttr {
        nla_len: (msg.len() - start) as u16,
        nla_type: attr_type | NLA_F_NESTED,
    };
    let bytes = unsafe {
        std::slice::from_raw_parts(
            std::ptr::addr_of!(attr).cast::<u8>(),
            mem::size_of::<NlAttr>(),
        )
    };
    msg[start..start + mem::size_of::<NlAttr>()].copy_from_slice(bytes);
}

/// Appends a null-terminated string attribute, 4-byte aligned.
fn add_attr_string(msg: &mut Vec<u8>, attr_type: u16, value: &str) {
    let value_bytes = value.as_bytes();
    let attr_len = mem::size_of::<NlAttr>() + value_bytes.len() + 1;
    let padded_len = (attr_len + 3) & !3;

    push_struct(
        msg,
        &NlAttr {
            nla_len: attr_len as u16,
            nla_type: attr_type,
        },
    );
    msg.extend_from_slice(value_bytes);
    msg.push(0);
    msg.resize(msg.len() + (padded_len - attr_len), 0);
}

/// Appends a u32 attribute.
fn add_attr_u32(msg: &mut Vec<u8>, attr_type: u16, value: u32) {
    push_struct(
        msg,
        &NlAttr {
            nla_len: (mem::size_of::<NlAttr>() + mem::size_of::<u32>()) as u16,
            nla_type: attr_type,
        },
    );
    msg.extend_from_slice(&value.to_ne_bytes());
}

/// Appends a raw bytes attribute, 4-byte aligned.
fn add_attr_bytes(msg: &mut Vec<u8>, attr_type: u16, value: &[u8]) {
    let attr_len = mem::size_of::<NlAttr>() + value.len();
    let padded_len = (attr_len + 3) & !3;

    push_struct(
        msg,
        &NlAttr {
            nla_len: attr_len as u16,
            nla_type: attr_type,
        },
    );
    msg.extend_from_slice(value);
    msg.resize(msg.len() + (padded_len - attr_len), 0);
}
