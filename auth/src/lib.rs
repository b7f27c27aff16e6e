pub mod biometric;
pub mod challenge;
pub mod credentials;
pub mod enrollment;
pub mod error;
pub mod hashing;
pub mod mailer;
pub mod password;
pub mod pending;
pub mod session;
pub mod tokens;
pub mod users;
pub mod webauthn;

pub use biometric::BiometricAuthService;
pub use challenge::{ChallengeCache, ChallengeContext, ChallengeState};
pub use credentials::{
    sign_count_action, CredentialStore, SignCountAction, SIGN_COUNT_REGRESSION_REASON,
    USER_REVOKED_REASON,
};
pub use enrollment::EnrollmentService;
pub use error::{AuthError, AuthResult};
pub use mailer::{LoggingMailer, Mailer};
pub use password::PasswordAuthService;
pub use pending::{PendingTokenKind, PendingTokenStore};
pub use session::SessionManager;
pub use tokens::{parse_duration, TokenClaims, TokenSigner, TokenSignerConfig};
pub use users::{normalize_email, UserStore};
pub use webauthn::{
    GeneratedChallenge, RegisteredCredential, RelyingParty, SignCountMode, VerifiedAssertion,
    WebauthnAdapter, WebauthnSettings,
};
