// Event types and codes used by the daemon (see [input-event-codes.h] and the [kernel docs]).
//
// [input-event-codes.h]: https://elixir.bootlin.com/linux/v6.1/source/include/uapi/linux/input-event-codes.h
// [kernel docs]: https://www.kernel.org/doc/html/latest/input/event-codes.html
pub const EV_SYN: u16 = 0x00;
pub const EV_KEY: u16 = 0x01;
pub const EV_MSC: u16 = 0x04;

/// End of one hardware report.
pub const SYN_REPORT: u16 = 0;
/// The kernel's event buffer overran and records were lost.
pub const SYN_DROPPED: u16 = 3;

pub const MSC_SCAN: u16 = 0x04;

pub const KEY_ENTER: u16 = 28;
pub const KEY_MAX: u16 = 0x2ff;

/// The `value` of an EV_KEY caused by a key being released.
pub const EV_KEY_RELEASE: i32 = 0;
/// The `value` of an EV_KEY caused by a key press.
pub const EV_KEY_PRESS: i32 = 1;
/// The `value` of an EV_KEY generated by autorepeat.
pub const EV_KEY_REPEAT: i32 = 2;
