use num_enum::{IntoPrimitive, TryFromPrimitive};

/// The control message vocabulary. The numeric values are wire constants shared with
///  deployed peers - do not renumber.
///
/// Every first-word value strictly below [PAYLOAD_SEQUENCE_BOUND] is a payload sequence
///  number rather than a control id; values in `[10000, 65534]` outside this set are
///  reserved and dropped on receipt.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u32)]
pub enum MessageId {
    Ping = 60000,
    Connect = 60001,
    RequestHost = 60002,
    StartHost = 60003,
    CheckHost = 60004,
    FoundHost = 60005,
    NoHost = 60006,
    HolePunched = 60007,
    Quit = 60008,
    SystemState = 60009,
    NewGame = 60010,

    Check = 65535,
}

/// First-word values below this bound are payload sequence numbers. The protocol therefore
///  tolerates at most 10000 outstanding sequences; 32-bit sequence wrap is not handled.
pub const PAYLOAD_SEQUENCE_BOUND: u32 = 10000;

pub fn is_payload_sequence(first_word: u32) -> bool {
    first_word < PAYLOAD_SEQUENCE_BOUND
}

/// The server forwards exactly these datagrams verbatim to the sender's partner: payload
///  packets and check beacons. All named control ids sit above the payload band and are
///  never relayed (notably `checkHost`, which the server answers itself).
pub fn is_relayed(first_word: u32) -> bool {
    is_payload_sequence(first_word) || first_word == MessageId::Check as u32
}
