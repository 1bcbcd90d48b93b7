//! Sequential validation of OS-level preconditions.
//!
//! The gate walks an ordered list of permissions and then an ordered list
//! of services. Each check may take several ticks to answer. The first
//! unmet item halts the chain and stays exposed until the user acts.

use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Permission {
    Bluetooth,
    BluetoothScan,
    Location,
    UsbAccess,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OsService {
    Bluetooth,
    Location,
}

/// A single item of the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Precondition {
    Permission(Permission),
    Service(OsService),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckStatus {
    Pending,
    Met,
    Unmet,
}

/// OS-side answers. Implemented by the platform bridge.
pub trait PermissionPlatform {
    fn check_permission(&mut self, permission: Permission) -> CheckStatus;
    fn check_service(&mut self, service: OsService) -> CheckStatus;
    /// Show the OS prompt for `permission`; the answer is observed through
    /// later `check_permission` calls.
    fn request_permission(&mut self, permission: Permission);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateStatus {
    Idle,
    Validating,
    Blocked(Precondition),
    Requesting(Permission),
    RequirementsMet,
    Denied(Permission),
}

#[derive(Debug)]
pub struct PermissionGate {
    chain: Vec<Precondition>,
    cursor: usize,
    status: GateStatus,
}

impl PermissionGate {
    pub fn new(permissions: &[Permission], services: &[OsService]) -> Self {
        let chain = permissions
            .iter()
            .copied()
            .map(Precondition::Permission)
            .chain(services.iter().copied().map(Precondition::Service))
            .collect();

        Self {
            chain,
            cursor: 0,
            status: GateStatus::Idle,
        }
    }

    pub fn status(&self) -> GateStatus {
        self.status
    }

    /// The item the chain is halted on, if any.
    pub fn outstanding(&self) -> Option<Precondition> {
        match self.status {
            GateStatus::Blocked(item) => Some(item),
            GateStatus::Requesting(p) | GateStatus::Denied(p) => Some(Precondition::Permission(p)),
            _ => None,
        }
    }

    /// Begin (or restart) validation from the first item.
    pub fn start(&mut self) {
        self.cursor = 0;
        self.status = GateStatus::Validating;
    }

    pub fn cancel(&mut self) {
        self.cursor = 0;
        self.status = GateStatus::Idle;
    }

    /// Advance as far as the platform allows this tick. Returns the new
    /// status when the chain halted, was satisfied, or restarted.
    pub fn poll(&mut self, platform: &mut dyn PermissionPlatform) -> Option<GateStatus> {
        match self.status {
            GateStatus::Validating => self.advance(platform),
            GateStatus::Requesting(permission) => {
                match platform.check_permission(permission) {
                    CheckStatus::Pending => None,
                    answer => {
                        debug!(?permission, ?answer, "permission prompt answered");
                        self.start();
                        self.advance(platform)
                    }
                }
            }
            GateStatus::Blocked(Precondition::Service(service)) => {
                match platform.check_service(service) {
                    CheckStatus::Met => {
                        debug!(?service, "service enabled, resuming validation");
                        self.status = GateStatus::Validating;
                        self.advance(platform)
                    }
                    _ => None,
                }
            }
            _ => None,
        }
    }

    /// Act on the blocking item. A permission gets the OS prompt; a service
    /// restarts the chain from the first item. Returns false when the chain
    /// is not halted.
    pub fn request(&mut self, platform: &mut dyn PermissionPlatform) -> bool {
        let permission = match self.status {
            GateStatus::Blocked(Precondition::Permission(p)) | GateStatus::Denied(p) => p,
            GateStatus::Blocked(Precondition::Service(service)) => {
                info!(?service, "re-validating after service request");
                self.start();
                return true;
            }
            _ => return false,
        };
        info!(?permission, "requesting permission");
        platform.request_permission(permission);
        self.status = GateStatus::Requesting(permission);
        true
    }

    /// The user declined outright.
    pub fn deny(&mut self) -> Option<Permission> {
        let permission = match self.status {
            GateStatus::Blocked(Precondition::Permission(p)) | GateStatus::Requesting(p) => p,
            _ => return None,
        };
        info!(?permission, "permission denied by user");
        self.status = GateStatus::Denied(permission);
        Some(permission)
    }

    fn advance(&mut self, platform: &mut dyn PermissionPlatform) -> Option<GateStatus> {
        while let Some(item) = self.chain.get(self.cursor).copied() {
            let answer = match item {
                Precondition::Permission(p) => platform.check_permission(p),
                Precondition::Service(s) => platform.check_service(s),
            };
            match answer {
                CheckStatus::Pending => return None,
                CheckStatus::Met => self.cursor += 1,
                CheckStatus::Unmet => {
                    debug!(?item, "precondition unmet");
                    self.status = GateStatus::Blocked(item);
                    return Some(self.status);
                }
            }
        }
        self.status = GateStatus::RequirementsMet;
        Some(self.status)
    }
}

#[derive(Debug)]
struct StaticPlatformState {
    permissions: HashMap<Permission, CheckStatus>,
    services: HashMap<OsService, CheckStatus>,
    prompt: Option<Permission>,
    grant_on_request: bool,
    requests: usize,
}

/// Platform with scripted answers, for the simulated transport and tests.
///
/// Anything not scripted is met. A prompt answers on the second check after
/// the request, so the round-trip is never synchronous.
#[derive(Debug, Clone)]
pub struct StaticPlatform {
    state: Rc<RefCell<StaticPlatformState>>,
}

impl StaticPlatform {
    pub fn all_granted() -> Self {
        Self {
            state: Rc::new(RefCell::new(StaticPlatformState {
                permissions: HashMap::new(),
                services: HashMap::new(),
                prompt: None,
                grant_on_request: true,
                requests: 0,
            })),
        }
    }

    pub fn set_permission(&self, permission: Permission, status: CheckStatus) {
        self.state.borrow_mut().permissions.insert(permission, status);
    }

    pub fn set_service(&self, service: OsService, status: CheckStatus) {
        self.state.borrow_mut().services.insert(service, status);
    }

    pub fn grant_on_request(&self, grant: bool) {
        self.state.borrow_mut().grant_on_request = grant;
    }

    pub fn request_count(&self) -> usize {
        self.state.borrow().requests
    }
}

impl PermissionPlatform for StaticPlatform {
    fn check_permission(&mut self, permission: Permission) -> CheckStatus {
        let mut state = self.state.borrow_mut();
        if state.prompt == Some(permission) {
            state.prompt = None;
            let answer = if state.grant_on_request {
                CheckStatus::Met
            } else {
                CheckStatus::Unmet
            };
            state.permissions.insert(permission, answer);
            return CheckStatus::Pending;
        }
        state
            .permissions
            .get(&permission)
            .copied()
            .unwrap_or(CheckStatus::Met)
    }

    fn check_service(&mut self, service: OsService) -> CheckStatus {
        self.state
            .borrow()
            .services
            .get(&service)
            .copied()
            .unwrap_or(CheckStatus::Met)
    }

    fn request_permission(&mut self, permission: Permission) {
        let mut state = self.state.borrow_mut();
        state.prompt = Some(permission);
        state.requests += 1;
    }
}
