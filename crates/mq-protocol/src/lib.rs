// mq-protocol: wire protocol for the relay-mq broker.
//
// Everything exchanged on a broker TCP socket is a `TransferFrame`: a
// self-synchronizing envelope carrying one message body (or, for producer
// messages, several concatenated bodies).  Message bodies use fixed-layout
// binary encoding with length-prefixed byte-string fields.
//
// The crate also carries the descriptor table that maps the 1-byte frame
// type to its metadata, the symmetric crypto capability used for register
// bodies, and the object pools that amortize allocation on the hot path.

mod crypto;
mod descriptor;
mod frame;
mod message;
mod pool;

pub use crypto::{Crypto, CryptoError, NoCrypto, TokenCrypto};
pub use descriptor::{
    CMESSAGE, Descriptor, HEARTBEAT_MESSAGE, MESSAGE_RESP, MessageType, NOT_IMPLEMENT_MESSAGE,
    PMESSAGE, REGISTER_MESSAGE, REGISTER_MESSAGE_RESP, RE_REGISTER_MESSAGE, TOTAL_MESSAGE_TYPES,
    USER_DEFINED_BASE, descriptor, is_user_space,
};
pub use frame::{
    CodecError, FRAME_HEAD, FRAME_OVERHEAD, FRAME_TAIL, FrameScanner, MAX_FRAME_DATA,
    TransferFrame, crc16,
};
pub use message::{
    Ack, BodyCursor, CMessage, LinkKind, MessageResponse, PMessage, RegisterMessage, RespStatus,
};
pub use pool::{CmPool, FramePool, PmPool, Pool, Poolable};
