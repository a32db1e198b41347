#[cfg(unix)]
mod unix;

#[cfg(unix)]
pub(crate) use self::unix::{pipe, Selector, SysEvent, WakeMsg, WAKE_MSG_SIZE};
#[cfg(unix)]
pub(crate) use self::unix::{WAKE_CMD_EMPTY, WAKE_CMD_QUIT, WAKE_CMD_USER_EVENT};
