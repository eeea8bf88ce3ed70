//! The `SteamSession` trait boundary: everything the crawler needs from a
//! live connection to Steam's network, without depending on a concrete
//! Steam-network crate (none exists in this workspace's dependency
//! ecosystem). A production binary wires a real implementation in;
//! `FakeSteamSession` below exercises the crawler's control flow in tests.

use std::collections::HashMap;
use std::fmt;

#[derive(Debug, Clone)]
pub struct ProductInfoRequest {
    pub app_id: u32,
    pub access_token: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct DepotInfo {
    pub depot_id: u32,
    pub owner_app_id: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct AppProductInfo {
    pub app_id: u32,
    pub name: Option<String>,
    pub depots: Vec<DepotInfo>,
    pub dlc_app_ids: Vec<u32>,
}

#[derive(Debug, Clone)]
pub struct ProductInfoBatch {
    pub apps: Vec<AppProductInfo>,
    /// Multi-part job: more callbacks are expected when this is `true`,
    /// i.e. there are still callbacks outstanding with `ResponsePending`
    /// set.
    pub response_pending: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ChangesSince {
    pub app_changes: Vec<u32>,
    pub last_change_number: u32,
    pub requires_full_update: bool,
    pub requires_full_app_update: bool,
}

#[derive(Debug)]
pub enum SessionError {
    ConnectTimeout,
    LogonFailed(String),
    NotConnected,
    JobTimeout,
    Disconnected,
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::ConnectTimeout => write!(f, "connect timed out"),
            SessionError::LogonFailed(reason) => write!(f, "logon failed: {reason}"),
            SessionError::NotConnected => write!(f, "not connected"),
            SessionError::JobTimeout => write!(f, "job wait timed out"),
            SessionError::Disconnected => write!(f, "disconnected while waiting"),
        }
    }
}

impl std::error::Error for SessionError {}

pub type SessionResult<T> = Result<T, SessionError>;

/// Credentials used for an authenticated logon.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub refresh_token: Option<String>,
    pub guard_data: Option<String>,
}

/// A long-lived connection to Steam's network, bounded by a 30s
/// connect/logon deadline.
pub trait SteamSession: Send {
    fn connect(&mut self) -> SessionResult<()>;
    fn disconnect(&mut self, intentional: bool);
    fn logon_anonymous(&mut self) -> SessionResult<()>;
    fn logon_with_token(&mut self, credentials: &Credentials) -> SessionResult<()>;
    fn is_logged_on(&self) -> bool;

    fn get_app_list(&mut self) -> SessionResult<Vec<u32>>;
    fn get_changes_since(&mut self, since: u32) -> SessionResult<ChangesSince>;
    fn get_access_tokens(&mut self, app_ids: &[u32]) -> SessionResult<HashMap<u32, u64>>;

    /// Issues a product-info job and blocks (subject to the caller's
    /// deadline) until the terminal, non-pending batch is available.
    fn get_product_info(&mut self, requests: &[ProductInfoRequest]) -> SessionResult<ProductInfoBatch>;

    fn current_change_number(&mut self) -> SessionResult<u32>;
}

/// In-memory fake used by tests: scripted responses, no real I/O.
#[derive(Default)]
pub struct FakeSteamSession {
    pub connected: bool,
    pub logged_on: bool,
    pub app_list: Vec<u32>,
    pub changes: ChangesSince,
    pub product_info: HashMap<u32, AppProductInfo>,
    pub current_change_number: u32,
}

impl SteamSession for FakeSteamSession {
    fn connect(&mut self) -> SessionResult<()> {
        self.connected = true;
        Ok(())
    }

    fn disconnect(&mut self, _intentional: bool) {
        self.connected = false;
        self.logged_on = false;
    }

    fn logon_anonymous(&mut self) -> SessionResult<()> {
        if !self.connected {
            return Err(SessionError::NotConnected);
        }
        self.logged_on = true;
        Ok(())
    }

    fn logon_with_token(&mut self, _credentials: &Credentials) -> SessionResult<()> {
        if !self.connected {
            return Err(SessionError::NotConnected);
        }
        self.logged_on = true;
        Ok(())
    }

    fn is_logged_on(&self) -> bool {
        self.logged_on
    }

    fn get_app_list(&mut self) -> SessionResult<Vec<u32>> {
        Ok(self.app_list.clone())
    }

    fn get_changes_since(&mut self, _since: u32) -> SessionResult<ChangesSince> {
        Ok(self.changes.clone())
    }

    fn get_access_tokens(&mut self, app_ids: &[u32]) -> SessionResult<HashMap<u32, u64>> {
        Ok(app_ids.iter().map(|id| (*id, 0)).collect())
    }

    fn get_product_info(&mut self, requests: &[ProductInfoRequest]) -> SessionResult<ProductInfoBatch> {
        let apps = requests
            .iter()
            .filter_map(|r| self.product_info.get(&r.app_id).cloned())
            .collect();
        Ok(ProductInfoBatch {
            apps,
            response_pending: false,
        })
    }

    fn current_change_number(&mut self) -> SessionResult<u32> {
        Ok(self.current_change_number)
    }
}
