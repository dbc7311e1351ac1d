//! NBD wire protocol: constants, fixed-layout records, error taxonomy.
//!
//! Based on https://github.com/NetworkBlockDevice/nbd/blob/master/doc/proto.md
//!
//! All integers are big-endian on the wire. Every record validates its magic
//! number when parsed; a mismatch is fatal to the connection.

#![allow(dead_code)]

use std::io;

use thiserror::Error;

// Magic values
pub const NBD_MAGIC: u64 = 0x4e42444d41474943; // "NBDMAGIC"
pub const NBD_OPTS_MAGIC: u64 = 0x49484156454F5054; // "IHAVEOPT"
pub const NBD_OPTION_REPLY_MAGIC: u64 = 0x0003e889045565a9;
pub const NBD_REQUEST_MAGIC: u32 = 0x25609513;
pub const NBD_SIMPLE_REPLY_MAGIC: u32 = 0x67446698;

// Handshake flags
pub const NBD_FLAG_FIXED_NEWSTYLE: u16 = 1 << 0;
pub const NBD_FLAG_NO_ZEROES: u16 = 1 << 1;

// Option types
pub const NBD_OPT_EXPORT_NAME: u32 = 1;
pub const NBD_OPT_ABORT: u32 = 2;
pub const NBD_OPT_LIST: u32 = 3;
pub const NBD_OPT_INFO: u32 = 6;
pub const NBD_OPT_GO: u32 = 7;

// Option replies
pub const NBD_REP_ACK: u32 = 1;
pub const NBD_REP_SERVER: u32 = 2;
pub const NBD_REP_INFO: u32 = 3;
pub const NBD_REP_ERR_UNSUP: u32 = 0x80000001;
pub const NBD_REP_ERR_POLICY: u32 = 0x80000002;
pub const NBD_REP_ERR_INVALID: u32 = 0x80000003;
pub const NBD_REP_ERR_UNKNOWN: u32 = 0x80000006;

// Info types
pub const NBD_INFO_EXPORT: u16 = 0;
pub const NBD_INFO_NAME: u16 = 1;
pub const NBD_INFO_DESCRIPTION: u16 = 2;
pub const NBD_INFO_BLOCK_SIZE: u16 = 3;

// Commands
pub const NBD_CMD_READ: u16 = 0;
pub const NBD_CMD_WRITE: u16 = 1;
pub const NBD_CMD_DISCONNECT: u16 = 2;
pub const NBD_CMD_FLUSH: u16 = 3;
pub const NBD_CMD_TRIM: u16 = 4;

// Transmission flags
pub const NBD_FLAG_HAS_FLAGS: u16 = 1 << 0;
pub const NBD_FLAG_READ_ONLY: u16 = 1 << 1;
pub const NBD_FLAG_SEND_FLUSH: u16 = 1 << 2;
pub const NBD_FLAG_SEND_FUA: u16 = 1 << 3;
pub const NBD_FLAG_ROTATIONAL: u16 = 1 << 4;
pub const NBD_FLAG_SEND_TRIM: u16 = 1 << 5;
pub const NBD_FLAG_CAN_MULTI_CONN: u16 = 1 << 8;

// Error codes (errno values echoed in simple replies)
pub const NBD_OK: u32 = 0;
pub const NBD_EPERM: u32 = 1;
pub const NBD_EIO: u32 = 5;
pub const NBD_ENOMEM: u32 = 12;
pub const NBD_EINVAL: u32 = 22;
pub const NBD_ENOSPC: u32 = 28;
pub const NBD_ESHUTDOWN: u32 = 108;

/// Default NBD port.
pub const NBD_DEFAULT_PORT: u16 = 10809;

/// Maximum payload size per the NBD protocol specification (32 MiB).
///
/// This is the default that portable clients expect servers to support. It
/// bounds memory allocation for READ/WRITE buffers.
pub const NBD_MAX_PAYLOAD_SIZE: u32 = 32 * 1024 * 1024;

/// NBD protocol errors.
#[derive(Debug, Error)]
pub enum NbdError {
    #[error("invalid magic: expected 0x{expected:x}, got 0x{actual:x}")]
    InvalidMagic { expected: u64, actual: u64 },

    #[error("request too large: {length} bytes (max: {max})")]
    RequestTooLarge { length: u64, max: u64 },

    #[error("unknown export: {name}")]
    UnknownExport { name: String },

    #[error("server block size range [{minimum}, {maximum}] does not admit {requested}")]
    UnsupportedServerBlockSize {
        requested: u32,
        minimum: u32,
        maximum: u32,
    },

    #[error("block size {chosen} below client minimum {minimum}")]
    BlockSizeBelowMinimum { chosen: u32, minimum: u32 },

    #[error("block size {chosen} above client maximum {maximum}")]
    BlockSizeAboveMaximum { chosen: u32, maximum: u32 },

    #[error("block size {chosen} is not a power of two")]
    BlockSizeNotPowerOfTwo { chosen: u32 },

    #[error("unknown info type: {info_type}")]
    UnknownInfo { info_type: u16 },

    #[error("unknown option reply type: 0x{reply_type:08x}")]
    UnknownReply { reply_type: u32 },

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

/// Server greeting opening the newstyle handshake (18 bytes on wire).
#[derive(Debug, Clone, Copy)]
pub struct NewstyleHandshake {
    pub handshake_flags: u16,
}

impl NewstyleHandshake {
    pub const SIZE_BYTES: usize = 18;

    pub fn to_bytes(&self) -> [u8; Self::SIZE_BYTES] {
        let mut buf = [0u8; Self::SIZE_BYTES];
        buf[0..8].copy_from_slice(&NBD_MAGIC.to_be_bytes());
        buf[8..16].copy_from_slice(&NBD_OPTS_MAGIC.to_be_bytes());
        buf[16..18].copy_from_slice(&self.handshake_flags.to_be_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8; Self::SIZE_BYTES]) -> Result<Self, NbdError> {
        let magic = u64::from_be_bytes(buf[0..8].try_into().unwrap());
        if magic != NBD_MAGIC {
            return Err(NbdError::InvalidMagic {
                expected: NBD_MAGIC,
                actual: magic,
            });
        }

        let opts_magic = u64::from_be_bytes(buf[8..16].try_into().unwrap());
        if opts_magic != NBD_OPTS_MAGIC {
            return Err(NbdError::InvalidMagic {
                expected: NBD_OPTS_MAGIC,
                actual: opts_magic,
            });
        }

        let handshake_flags = u16::from_be_bytes(buf[16..18].try_into().unwrap());
        Ok(Self { handshake_flags })
    }
}

/// Option request header sent by the client during haggling (16 bytes).
///
/// `length` bytes of option data follow the header.
#[derive(Debug, Clone, Copy)]
pub struct OptionHeader {
    pub option: u32,
    pub length: u32,
}

impl OptionHeader {
    pub const SIZE_BYTES: usize = 16;

    pub fn to_bytes(&self) -> [u8; Self::SIZE_BYTES] {
        let mut buf = [0u8; Self::SIZE_BYTES];
        buf[0..8].copy_from_slice(&NBD_OPTS_MAGIC.to_be_bytes());
        buf[8..12].copy_from_slice(&self.option.to_be_bytes());
        buf[12..16].copy_from_slice(&self.length.to_be_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8; Self::SIZE_BYTES]) -> Result<Self, NbdError> {
        let magic = u64::from_be_bytes(buf[0..8].try_into().unwrap());
        if magic != NBD_OPTS_MAGIC {
            return Err(NbdError::InvalidMagic {
                expected: NBD_OPTS_MAGIC,
                actual: magic,
            });
        }

        let option = u32::from_be_bytes(buf[8..12].try_into().unwrap());
        let length = u32::from_be_bytes(buf[12..16].try_into().unwrap());
        Ok(Self { option, length })
    }
}

/// Option reply header sent by the server during haggling (20 bytes).
///
/// `length` bytes of reply data follow the header. The `option` field echoes
/// the option the reply belongs to.
#[derive(Debug, Clone, Copy)]
pub struct OptionReply {
    pub option: u32,
    pub reply_type: u32,
    pub length: u32,
}

impl OptionReply {
    pub const SIZE_BYTES: usize = 20;

    pub fn to_bytes(&self) -> [u8; Self::SIZE_BYTES] {
        let mut buf = [0u8; Self::SIZE_BYTES];
        buf[0..8].copy_from_slice(&NBD_OPTION_REPLY_MAGIC.to_be_bytes());
        buf[8..12].copy_from_slice(&self.option.to_be_bytes());
        buf[12..16].copy_from_slice(&self.reply_type.to_be_bytes());
        buf[16..20].copy_from_slice(&self.length.to_be_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8; Self::SIZE_BYTES]) -> Result<Self, NbdError> {
        let magic = u64::from_be_bytes(buf[0..8].try_into().unwrap());
        if magic != NBD_OPTION_REPLY_MAGIC {
            return Err(NbdError::InvalidMagic {
                expected: NBD_OPTION_REPLY_MAGIC,
                actual: magic,
            });
        }

        let option = u32::from_be_bytes(buf[8..12].try_into().unwrap());
        let reply_type = u32::from_be_bytes(buf[12..16].try_into().unwrap());
        let length = u32::from_be_bytes(buf[16..20].try_into().unwrap());
        Ok(Self {
            option,
            reply_type,
            length,
        })
    }
}

/// EXPORT info sub-reply payload (12 bytes including the info type tag).
#[derive(Debug, Clone, Copy)]
pub struct InfoExport {
    pub size: u64,
    pub transmission_flags: u16,
}

impl InfoExport {
    pub const SIZE_BYTES: usize = 12;

    pub fn to_bytes(&self) -> [u8; Self::SIZE_BYTES] {
        let mut buf = [0u8; Self::SIZE_BYTES];
        buf[0..2].copy_from_slice(&NBD_INFO_EXPORT.to_be_bytes());
        buf[2..10].copy_from_slice(&self.size.to_be_bytes());
        buf[10..12].copy_from_slice(&self.transmission_flags.to_be_bytes());
        buf
    }

    /// Parse from an info payload whose leading type tag the caller has
    /// already dispatched on.
    pub fn from_bytes(buf: &[u8; Self::SIZE_BYTES]) -> Self {
        Self {
            size: u64::from_be_bytes(buf[2..10].try_into().unwrap()),
            transmission_flags: u16::from_be_bytes(buf[10..12].try_into().unwrap()),
        }
    }
}

/// BLOCK_SIZE info sub-reply payload (14 bytes including the info type tag).
#[derive(Debug, Clone, Copy)]
pub struct InfoBlockSize {
    pub minimum: u32,
    pub preferred: u32,
    pub maximum: u32,
}

impl InfoBlockSize {
    pub const SIZE_BYTES: usize = 14;

    pub fn to_bytes(&self) -> [u8; Self::SIZE_BYTES] {
        let mut buf = [0u8; Self::SIZE_BYTES];
        buf[0..2].copy_from_slice(&NBD_INFO_BLOCK_SIZE.to_be_bytes());
        buf[2..6].copy_from_slice(&self.minimum.to_be_bytes());
        buf[6..10].copy_from_slice(&self.preferred.to_be_bytes());
        buf[10..14].copy_from_slice(&self.maximum.to_be_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8; Self::SIZE_BYTES]) -> Self {
        Self {
            minimum: u32::from_be_bytes(buf[2..6].try_into().unwrap()),
            preferred: u32::from_be_bytes(buf[6..10].try_into().unwrap()),
            maximum: u32::from_be_bytes(buf[10..14].try_into().unwrap()),
        }
    }
}

/// Transmission request (28 bytes on wire).
///
/// `command` is kept raw: unknown commands are answered with EINVAL at the
/// session layer rather than rejected at parse time.
#[derive(Debug, Clone, Copy)]
pub struct NbdRequest {
    pub flags: u16,
    pub command: u16,
    pub handle: u64,
    pub offset: u64,
    pub length: u32,
}

impl NbdRequest {
    pub const SIZE_BYTES: usize = 28;

    pub fn to_bytes(&self) -> [u8; Self::SIZE_BYTES] {
        let mut buf = [0u8; Self::SIZE_BYTES];
        buf[0..4].copy_from_slice(&NBD_REQUEST_MAGIC.to_be_bytes());
        buf[4..6].copy_from_slice(&self.flags.to_be_bytes());
        buf[6..8].copy_from_slice(&self.command.to_be_bytes());
        buf[8..16].copy_from_slice(&self.handle.to_be_bytes());
        buf[16..24].copy_from_slice(&self.offset.to_be_bytes());
        buf[24..28].copy_from_slice(&self.length.to_be_bytes());
        buf
    }

    /// Parse and validate a transmission request.
    ///
    /// `max_payload` bounds the declared length; anything larger is fatal to
    /// the session since the payload framing can no longer be trusted to fit
    /// in memory.
    pub fn from_bytes(buf: &[u8; Self::SIZE_BYTES], max_payload: usize) -> Result<Self, NbdError> {
        let magic = u32::from_be_bytes(buf[0..4].try_into().unwrap());
        if magic != NBD_REQUEST_MAGIC {
            return Err(NbdError::InvalidMagic {
                expected: NBD_REQUEST_MAGIC as u64,
                actual: magic as u64,
            });
        }

        let flags = u16::from_be_bytes(buf[4..6].try_into().unwrap());
        let command = u16::from_be_bytes(buf[6..8].try_into().unwrap());
        let handle = u64::from_be_bytes(buf[8..16].try_into().unwrap());
        let offset = u64::from_be_bytes(buf[16..24].try_into().unwrap());
        let length = u32::from_be_bytes(buf[24..28].try_into().unwrap());

        if length as usize > max_payload {
            return Err(NbdError::RequestTooLarge {
                length: length as u64,
                max: max_payload as u64,
            });
        }

        Ok(Self {
            flags,
            command,
            handle,
            offset,
            length,
        })
    }
}

/// Simple transmission reply (16 bytes on wire).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NbdReply {
    pub error: u32,
    pub handle: u64,
}

impl NbdReply {
    pub const SIZE_BYTES: usize = 16;

    pub fn ok(handle: u64) -> Self {
        Self {
            error: NBD_OK,
            handle,
        }
    }

    pub fn error(handle: u64, error: u32) -> Self {
        Self { error, handle }
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE_BYTES] {
        let mut buf = [0u8; Self::SIZE_BYTES];
        buf[0..4].copy_from_slice(&NBD_SIMPLE_REPLY_MAGIC.to_be_bytes());
        buf[4..8].copy_from_slice(&self.error.to_be_bytes());
        buf[8..16].copy_from_slice(&self.handle.to_be_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8; Self::SIZE_BYTES]) -> Result<Self, NbdError> {
        let magic = u32::from_be_bytes(buf[0..4].try_into().unwrap());
        if magic != NBD_SIMPLE_REPLY_MAGIC {
            return Err(NbdError::InvalidMagic {
                expected: NBD_SIMPLE_REPLY_MAGIC as u64,
                actual: magic as u64,
            });
        }

        let error = u32::from_be_bytes(buf[4..8].try_into().unwrap());
        let handle = u64::from_be_bytes(buf[8..16].try_into().unwrap());
        Ok(Self { error, handle })
    }
}

const _: () = {
    assert!(NewstyleHandshake::SIZE_BYTES == 18);
    assert!(OptionHeader::SIZE_BYTES == 16);
    assert!(OptionReply::SIZE_BYTES == 20);
    assert!(NbdRequest::SIZE_BYTES == 28);
    assert!(NbdReply::SIZE_BYTES == 16);
};
