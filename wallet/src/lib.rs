pub mod error;
pub mod service;
pub mod transfer;

pub use error::{WalletError, WalletResult};
pub use service::{
    mask_email, mask_name, utc_midnight, RecipientUser, WalletConfig, WalletService,
};
pub use transfer::{TransferEngine, STEP_UP_TRANSFER_PURPOSE, TRANSFER_TYPE};
