use uuid::Uuid;

/**
 * The UUID of the Improv WiFi provisioning GATT service.
 */
pub const IMPROV_SERVICE: Uuid = Uuid::from_u128(0x00467768_6228_2272_4663_277478268000);

/**
 * Current state of the device (notify + read), a single byte.
 */
pub const CURRENT_STATE_CHARACTERISTIC: Uuid = Uuid::from_u128(0x00467768_6228_2272_4663_277478268001);

/**
 * Last error reported by the device (notify + read), a single byte.
 */
pub const ERROR_STATE_CHARACTERISTIC: Uuid = Uuid::from_u128(0x00467768_6228_2272_4663_277478268002);

/**
 * RPC command frames are written here.
 */
pub const RPC_COMMAND_CHARACTERISTIC: Uuid = Uuid::from_u128(0x00467768_6228_2272_4663_277478268003);

/**
 * RPC result frames are notified here: `[command, message length, message...]`.
 */
pub const RPC_RESULT_CHARACTERISTIC: Uuid = Uuid::from_u128(0x00467768_6228_2272_4663_277478268004);

/**
 * Capabilities bitmask of the device (read).
 */
pub const CAPABILITIES_CHARACTERISTIC: Uuid = Uuid::from_u128(0x00467768_6228_2272_4663_277478268005);

pub const STATE_READY: u8 = 0x02;
pub const STATE_PROVISIONING: u8 = 0x03;
pub const STATE_PROVISIONED: u8 = 0x04;

pub const ERROR_NONE: u8 = 0x00;
pub const ERROR_INVALID_RPC: u8 = 0x01;
pub const ERROR_UNKNOWN_RPC: u8 = 0x02;
pub const ERROR_UNABLE_TO_CONNECT: u8 = 0x03;
pub const ERROR_NOT_AUTHORIZED: u8 = 0x04;

pub const COMMAND_WIFI_SETTINGS: u8 = 0x01;
pub const COMMAND_IDENTIFY: u8 = 0x02;

/**
 * Every length in a frame is a single unsigned byte.
 */
pub const MAX_FIELD_LEN: usize = u8::MAX as usize;
