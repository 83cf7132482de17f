//! Wire constants of the key/value request family.

use trunkline_net::{ControlCodes, RequestDescriptor, RequestType};

/// Version all key/value requests currently speak.
pub const REQUEST_VERSION: u8 = 1;

/// Command codes.
pub mod command {
    pub const PUT: u8 = 1;
    pub const GET: u8 = 2;
    pub const GET_ALL: u8 = 3;
    pub const DOUBLE_PUT: u8 = 4;
    pub const ROUND_ROBIN_PUT: u8 = 5;
}

/// Reply bytes of Put-shaped requests.
pub mod put_reply {
    pub const OK: u8 = 1;
    pub const ERROR: u8 = 2;
}

/// Reply bytes of Get.
pub mod get_reply {
    pub const VALUE: u8 = 1;
    pub const NOTHING: u8 = 2;
    pub const ERROR: u8 = 3;
}

/// Message-type bytes of the GetAll stream.
pub mod stream_msg {
    pub const RECORD: u8 = 1;
    pub const END: u8 = 2;
    pub const ACK: u8 = 3;
    pub const ERROR: u8 = 4;
    pub const SUSPEND: u8 = 5;
    pub const RESUME: u8 = 6;
    pub const STOP: u8 = 7;
}

/// GetAll's control-plane code assignment.
pub const GET_ALL_CONTROL: ControlCodes = ControlCodes {
    suspend: stream_msg::SUSPEND,
    resume: stream_msg::RESUME,
    stop: stream_msg::STOP,
    ack: stream_msg::ACK,
};

/// Manual resume codes the client uses to poke a GetAll's control fiber.
pub mod resume_code {
    pub const SUSPEND: i64 = 1;
    pub const RESUME: i64 = 2;
    pub const STOP: i64 = 3;
}

pub const PUT: RequestDescriptor =
    RequestDescriptor::new(command::PUT, REQUEST_VERSION, RequestType::SingleNode);
pub const GET: RequestDescriptor =
    RequestDescriptor::new(command::GET, REQUEST_VERSION, RequestType::SingleNode);
pub const GET_ALL: RequestDescriptor =
    RequestDescriptor::new(command::GET_ALL, REQUEST_VERSION, RequestType::AllNodes);
pub const DOUBLE_PUT: RequestDescriptor =
    RequestDescriptor::new(command::DOUBLE_PUT, REQUEST_VERSION, RequestType::MultiNode);
pub const ROUND_ROBIN_PUT: RequestDescriptor = RequestDescriptor::new(
    command::ROUND_ROBIN_PUT,
    REQUEST_VERSION,
    RequestType::RoundRobin,
);
