/// Lifecycle notifications pushed from the session engine to the application through the
///  event sink it supplied at session start.
///
/// Establishment progresses through `ConnectedToServer` and then either `HostWaiting` →
///  `FoundClient` (host side) or `FoundHost` / `NoHost` (joiner side); `ConnectionFailed`
///  and `TimedOut` terminate an attempt. The remaining events occur in steady state and do
///  not close the session - after `PlayerQuit` the application may still drain the mailbox
///  before closing.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum SessionEvent {
    ConnectedToServer,
    HostWaiting,
    FoundClient,
    NoHost,
    FoundHost,
    ConnectionFailed,
    TimedOut,
    NewGame,
    PlayerQuit,
    ConnectionLost,
    Reconnected,
}
