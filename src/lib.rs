pub mod binding;
pub mod config;
pub mod error;
pub mod hook;
pub mod host;
pub mod identity;
pub mod lifecycle;
pub mod provider;
pub mod proxy;
pub mod shim;
pub mod store;

pub use binding::{BypassBinding, CertificateBinding, TokenConfirmation};
pub use config::{
    CertificateStoreConfig, CustomCertConfig, DEFAULT_CONFIG_PATH, ExperimentalConfig,
    FailurePolicy, HYTALE_ALPN, ProxyTrustPolicy,
};
pub use error::{BindingError, ConfigError, InstallError, ShimError, StartupError, StoreError};
pub use hook::{
    BindingValidator, CertificateSource, ConnectionPreprocessor, HOOK_ABI_VERSION, HostHooks,
    RecordingHost, RequestContext,
};
pub use host::QuicHost;
pub use identity::{CertificateIdentity, IdentityOrigin, compute_certificate_fingerprint};
pub use lifecycle::{LifecycleController, LifecycleState, StartupOutcome};
pub use provider::{CertificateProviderAdapter, InstalledCertificate};
pub use proxy::{ProxyCommand, ProxyFraming, ProxyHeader, read_proxy_header};
pub use shim::{HandshakeContext, ProxyShim, RawConnectionMeta};
pub use store::{CertificateStore, generate_ephemeral};
