use std::fmt;

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum AppState {
    Unknown,
    Available,
    AvailableLocal,
    Installed,
    Installing,
    Updatable,
    UpdatableLive,
    Removing,
    Unavailable,
}

impl AppState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Available => "available",
            Self::AvailableLocal => "available-local",
            Self::Installed => "installed",
            Self::Installing => "installing",
            Self::Updatable => "updatable",
            Self::UpdatableLive => "updatable-live",
            Self::Removing => "removing",
            Self::Unavailable => "unavailable",
        }
    }

    /// Installing and Removing only exist while a transaction runs.
    pub fn is_transient(self) -> bool {
        matches!(self, Self::Installing | Self::Removing)
    }

    pub fn is_installed(self) -> bool {
        matches!(self, Self::Installed | Self::Updatable | Self::UpdatableLive)
    }

    pub fn is_updatable(self) -> bool {
        matches!(self, Self::Updatable | Self::UpdatableLive)
    }

    pub fn allows_transition(self, next: AppState) -> bool {
        use AppState::*;

        if self == next || self == Unknown || next == Unknown {
            return true;
        }

        match self {
            Available => matches!(next, Installing | Installed | Unavailable),
            AvailableLocal => matches!(next, Installing | Installed),
            Installed => matches!(
                next,
                Removing | Updatable | UpdatableLive | Unavailable | Available
            ),
            Installing => matches!(
                next,
                Installed | Available | AvailableLocal | Updatable | UpdatableLive
            ),
            Removing => matches!(next, Installed | Available),
            Updatable => matches!(next, Installed | Installing | Removing | UpdatableLive),
            UpdatableLive => matches!(next, Installed | Installing | Removing | Updatable),
            Unavailable => matches!(next, Available | Installed),
            Unknown => true,
        }
    }
}

impl fmt::Display for AppState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PendingAction {
    Install,
    Update,
    Remove,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Progress {
    #[default]
    Unknown,
    Percent(u32),
}

impl Progress {
    pub fn percent(self) -> Option<u32> {
        match self {
            Self::Unknown => None,
            Self::Percent(value) => Some(value),
        }
    }
}
