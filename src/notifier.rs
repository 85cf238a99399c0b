use serde_derive::Serialize;

use crate::presence::NotificationHandle;

pub const NOTIFICATION_GROUP: &str = "beacon-group";
pub const NOTIFICATION_TITLE: &str = "Beacon Presence";
/// Handle of the group summary. Summaries are routed by `summary`, not by
/// handle, so this may coincide with a presence handle.
pub const SUMMARY_HANDLE: NotificationHandle = NotificationHandle(1234);

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    #[serde(skip)]
    pub handle: NotificationHandle,
    pub title: String,
    pub text: String,
    pub group: String,
    pub summary: bool,
}

impl Notification {
    pub fn presence(handle: NotificationHandle, text: String) -> Self {
        Notification {
            handle,
            title: NOTIFICATION_TITLE.to_string(),
            text,
            group: NOTIFICATION_GROUP.to_string(),
            summary: false,
        }
    }

    pub fn summary(active: usize) -> Self {
        Notification {
            handle: SUMMARY_HANDLE,
            title: NOTIFICATION_TITLE.to_string(),
            text: format!("{active} beacons nearby"),
            group: NOTIFICATION_GROUP.to_string(),
            summary: true,
        }
    }
}

/// The persistent "scanning" indicator, with a control that stops scanning.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct ForegroundStatus {
    pub title: String,
    pub text: String,
    pub ongoing: bool,
    /// Topic to publish to in order to stop scanning.
    pub stop_action: String,
}

/// Where presence notifications end up.
///
/// Implementations are best effort; callers log failures and carry on.
pub trait Notifier {
    type Error: std::fmt::Debug;

    fn notify(&self, notification: &Notification) -> Result<(), Self::Error>;

    fn cancel(&self, handle: NotificationHandle) -> Result<(), Self::Error>;

    fn cancel_all(&self) -> Result<(), Self::Error>;

    fn show_foreground(&self, status: &ForegroundStatus) -> Result<(), Self::Error>;

    fn clear_foreground(&self) -> Result<(), Self::Error>;
}

#[cfg(test)]
pub mod testing {
    use std::convert::Infallible;
    use std::sync::Mutex;

    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Call {
        Notify(Notification),
        Cancel(NotificationHandle),
        CancelAll,
        ShowForeground,
        ClearForeground,
    }

    /// Records every call for assertions.
    #[derive(Default)]
    pub struct RecordingNotifier {
        pub calls: Mutex<Vec<Call>>,
    }

    impl RecordingNotifier {
        pub fn take(&self) -> Vec<Call> {
            std::mem::take(&mut *self.calls.lock().unwrap())
        }

        fn record(&self, call: Call) -> Result<(), Infallible> {
            self.calls.lock().unwrap().push(call);
            Ok(())
        }
    }

    impl Notifier for RecordingNotifier {
        type Error = Infallible;

        fn notify(&self, notification: &Notification) -> Result<(), Infallible> {
            self.record(Call::Notify(notification.clone()))
        }

        fn cancel(&self, handle: NotificationHandle) -> Result<(), Infallible> {
            self.record(Call::Cancel(handle))
        }

        fn cancel_all(&self) -> Result<(), Infallible> {
            self.record(Call::CancelAll)
        }

        fn show_foreground(&self, _status: &ForegroundStatus) -> Result<(), Infallible> {
            self.record(Call::ShowForeground)
        }

        fn clear_foreground(&self) -> Result<(), Infallible> {
            self.record(Call::ClearForeground)
        }
    }
}
