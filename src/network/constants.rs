/**
 * Host suffixes covered by the broad scan of a range, network and broadcast addresses excluded.
 */
pub const FIRST_HOST: u8 = 1;
pub const LAST_HOST: u8 = 254;

/**
 * Size of the channel buffer used for events published by the scanner.
 */
pub const EVENT_BUFFER: usize = 64;
