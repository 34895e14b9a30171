//! Startup orchestration.
//!
//! Runs once, before the host accepts connections: load the store, install the provider
//! adapter, install the shim. Any failure rolls the host back to native behavior and ends in
//! `Degraded` or `Failed` depending on the failure policy. Nothing is retried.

use std::fmt;
use std::sync::Arc;

use tracing::{error, info, warn};

use crate::binding::BypassBinding;
use crate::config::{CustomCertConfig, FailurePolicy};
use crate::error::StartupError;
use crate::hook::{HostHooks, check_abi_version};
use crate::provider::{CertificateProviderAdapter, InstalledCertificate};
use crate::shim::ProxyShim;
use crate::store::CertificateStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Uninitialized,
    StoreLoaded,
    AdapterInstalled,
    ShimInstalled,
    Active,
    /// Startup failed and the host runs with its native certificate behavior.
    Degraded,
    /// Startup failed under the strict policy.
    Failed,
}

impl LifecycleState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            LifecycleState::Active | LifecycleState::Degraded | LifecycleState::Failed
        )
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug)]
pub enum StartupOutcome {
    Active(InstalledCertificate),
    /// The error that caused the fallback to native behavior.
    Degraded(StartupError),
}

pub struct LifecycleController {
    config: CustomCertConfig,
    adapter: CertificateProviderAdapter,
    state: LifecycleState,
    history: Vec<LifecycleState>,
}

impl LifecycleController {
    pub fn new(config: CustomCertConfig) -> Self {
        Self {
            config,
            adapter: CertificateProviderAdapter::new(),
            state: LifecycleState::Uninitialized,
            history: vec![LifecycleState::Uninitialized],
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// Every state visited so far, in order.
    pub fn history(&self) -> &[LifecycleState] {
        &self.history
    }

    pub fn config(&self) -> &CustomCertConfig {
        &self.config
    }

    /// The persistent certificate, only while the controller is `Active`.
    pub fn installed(&self) -> Option<InstalledCertificate> {
        match self.state {
            LifecycleState::Active => self.adapter.installed(),
            _ => None,
        }
    }

    /// Runs the startup sequence against `host`.
    ///
    /// Under [`FailurePolicy::Strict`] a failing step returns the error and leaves the
    /// controller `Failed`. Under [`FailurePolicy::Degrade`] it returns
    /// [`StartupOutcome::Degraded`]. Either way the host is restored to native behavior first.
    pub fn start<H: HostHooks>(&mut self, host: &mut H) -> Result<StartupOutcome, StartupError> {
        if self.state != LifecycleState::Uninitialized {
            return Err(StartupError::AlreadyStarted);
        }

        match self.install(host) {
            Ok(installed) => {
                self.transition(LifecycleState::Active);
                info!(
                    fingerprint = %installed.identity().fingerprint(),
                    "Persistent certificate active"
                );
                Ok(StartupOutcome::Active(installed))
            }
            Err(e) => {
                host.restore_native();
                match self.config.failure_policy {
                    FailurePolicy::Strict => {
                        self.transition(LifecycleState::Failed);
                        error!("Startup failed at {:?}: {e}", self.last_step());
                        Err(e)
                    }
                    FailurePolicy::Degrade => {
                        self.transition(LifecycleState::Degraded);
                        warn!("Falling back to native certificate behavior: {e}");
                        Ok(StartupOutcome::Degraded(e))
                    }
                }
            }
        }
    }

    fn install<H: HostHooks>(&mut self, host: &mut H) -> Result<InstalledCertificate, StartupError> {
        let store = CertificateStore::new(self.config.store.clone());
        let identity = store.load()?;
        self.transition(LifecycleState::StoreLoaded);

        check_abi_version(host)?;
        let installed = self.adapter.install(Arc::new(identity))?;
        host.install_certificate_source(Arc::new(installed.clone()))?;
        self.transition(LifecycleState::AdapterInstalled);

        let shim = ProxyShim::new(Arc::new(self.config.proxy.clone()), installed.clone());
        host.install_connection_preprocessor(Arc::new(shim))?;
        if self.config.experimental.bypass_client_certificate_binding {
            warn!("Client certificate binding checks are bypassed");
            host.install_binding_validator(Arc::new(BypassBinding))?;
        }
        self.transition(LifecycleState::ShimInstalled);

        Ok(installed)
    }

    fn transition(&mut self, next: LifecycleState) {
        info!("Lifecycle: {} -> {next}", self.state);
        self.state = next;
        self.history.push(next);
    }

    /// The last non-terminal state reached.
    fn last_step(&self) -> LifecycleState {
        self.history
            .iter()
            .rev()
            .copied()
            .find(|state| !state.is_terminal())
            .unwrap_or(LifecycleState::Uninitialized)
    }
}

#[cfg(test)]
mod tests {
    use super::LifecycleState::*;
    use super::*;
    use crate::error::{InstallError, StoreError};
    use crate::hook::{BindingValidator, HOOK_ABI_VERSION, HookPoint, RecordingHost};
    use crate::store::tests::{Fixture, expired, self_signed};

    fn config(fixture: &Fixture, policy: FailurePolicy) -> CustomCertConfig {
        CustomCertConfig {
            store: fixture.config.clone(),
            failure_policy: policy,
            ..CustomCertConfig::default()
        }
    }

    #[test]
    fn valid_material_reaches_active() {
        let (cert, key) = self_signed("play.example.test");
        let fixture = Fixture::with_material(&cert, &key);
        let mut host = RecordingHost::new();
        let mut controller = LifecycleController::new(config(&fixture, FailurePolicy::Strict));

        let outcome = controller.start(&mut host).unwrap();
        let StartupOutcome::Active(installed) = outcome else {
            panic!("expected the persistent certificate to be active");
        };

        assert_eq!(
            controller.history(),
            &[Uninitialized, StoreLoaded, AdapterInstalled, ShimInstalled, Active]
        );
        assert!(host.certificate_source().is_some());
        assert!(host.preprocessor().is_some());
        assert!(host.binding_validator().is_none());
        assert_eq!(
            controller.installed().unwrap().identity().fingerprint(),
            installed.identity().fingerprint()
        );
    }

    #[test]
    fn bypass_installs_binding_validator() {
        let (cert, key) = self_signed("play.example.test");
        let fixture = Fixture::with_material(&cert, &key);
        let mut config = config(&fixture, FailurePolicy::Strict);
        config.experimental.bypass_client_certificate_binding = true;

        let mut host = RecordingHost::new();
        LifecycleController::new(config).start(&mut host).unwrap();

        let validator = host.binding_validator().unwrap();
        assert!(validator.validate(Some("anything"), None).is_ok());
    }

    #[test]
    fn expired_material_fails_under_strict_policy() {
        let (cert, key) = expired("play.example.test");
        let fixture = Fixture::with_material(&cert, &key);
        let mut config = config(&fixture, FailurePolicy::Strict);
        config.store.require_valid_chain = true;

        let mut host = RecordingHost::new();
        let mut controller = LifecycleController::new(config);
        let err = controller.start(&mut host).unwrap_err();

        assert!(matches!(
            err,
            StartupError::Store(StoreError::ExpiredCertificate { .. })
        ));
        assert_eq!(controller.state(), Failed);
        assert!(host.is_native());
    }

    #[test]
    fn expired_material_degrades_under_degrade_policy() {
        let (cert, key) = expired("play.example.test");
        let fixture = Fixture::with_material(&cert, &key);
        let mut config = config(&fixture, FailurePolicy::Degrade);
        config.store.require_valid_chain = true;

        let mut host = RecordingHost::new();
        let mut controller = LifecycleController::new(config);
        let outcome = controller.start(&mut host).unwrap();

        assert!(matches!(
            outcome,
            StartupOutcome::Degraded(StartupError::Store(StoreError::ExpiredCertificate { .. }))
        ));
        assert_eq!(controller.history(), &[Uninitialized, Degraded]);
        assert!(host.is_native());
        assert!(host.was_restored());
    }

    #[test]
    fn failed_shim_install_rolls_back_the_adapter() {
        let (cert, key) = self_signed("play.example.test");
        let fixture = Fixture::with_material(&cert, &key);
        let mut host = RecordingHost::new().without_hook(HookPoint::ConnectionPreprocessor);
        let mut controller = LifecycleController::new(config(&fixture, FailurePolicy::Degrade));

        let outcome = controller.start(&mut host).unwrap();
        assert!(matches!(
            outcome,
            StartupOutcome::Degraded(StartupError::Install(InstallError::HookUnavailable(_)))
        ));
        assert_eq!(
            controller.history(),
            &[Uninitialized, StoreLoaded, AdapterInstalled, Degraded]
        );
        assert!(host.certificate_source().is_none());
        assert!(controller.installed().is_none());
    }

    #[test]
    fn hook_version_mismatch_fails_before_installing() {
        let (cert, key) = self_signed("play.example.test");
        let fixture = Fixture::with_material(&cert, &key);
        let mut host = RecordingHost::new().with_abi_version(HOOK_ABI_VERSION + 1);
        let mut controller = LifecycleController::new(config(&fixture, FailurePolicy::Strict));

        let err = controller.start(&mut host).unwrap_err();
        assert!(matches!(
            err,
            StartupError::Install(InstallError::HookVersionMismatch { .. })
        ));
        assert!(!err.is_operator_fixable());
        assert_eq!(controller.history(), &[Uninitialized, StoreLoaded, Failed]);
        assert!(controller.installed().is_none());
    }

    #[test]
    fn missing_material_degrades() {
        let fixture = Fixture::empty();
        let mut host = RecordingHost::new();
        let mut controller = LifecycleController::new(config(&fixture, FailurePolicy::Degrade));

        let outcome = controller.start(&mut host).unwrap();
        assert!(matches!(
            outcome,
            StartupOutcome::Degraded(StartupError::Store(StoreError::MissingMaterial { .. }))
        ));
    }

    #[test]
    fn generated_identity_is_reused_after_restart() {
        let fixture = Fixture::empty();
        let mut config = config(&fixture, FailurePolicy::Strict);
        config.store.auto_generate_if_missing = true;

        let mut first = LifecycleController::new(config.clone());
        first.start(&mut RecordingHost::new()).unwrap();
        let mut second = LifecycleController::new(config);
        second.start(&mut RecordingHost::new()).unwrap();

        assert_eq!(
            first.installed().unwrap().identity().fingerprint(),
            second.installed().unwrap().identity().fingerprint()
        );
    }

    #[test]
    fn starting_twice_is_refused() {
        let fixture = Fixture::empty();
        let mut host = RecordingHost::new();
        let mut controller = LifecycleController::new(config(&fixture, FailurePolicy::Degrade));

        controller.start(&mut host).unwrap();
        assert!(matches!(
            controller.start(&mut host),
            Err(StartupError::AlreadyStarted)
        ));
        assert_eq!(controller.state(), Degraded);
    }
}
