use std::process::ExitCode;

use crate::error::UpgradeError;

pub const EXIT_USAGE: u8 = 64;
pub const EXIT_IO: u8 = 2;
pub const EXIT_SOFTWARE: u8 = 1;

pub fn exit_code_for_upgrade_error(error: &UpgradeError) -> ExitCode {
    use UpgradeError::*;

    match error {
        // The operator pointed the tool at the wrong database, passed a bad
        // key, or declared an incomplete wallet mapping.
        Usage(_) | NotIndyWallet | DecryptionFailed(_) | WalletAlignment(_)
        | MissingWallet(_) | InvalidUri(_) => ExitCode::from(EXIT_USAGE),

        Db(_) | Io(_) | NotConnected => ExitCode::from(EXIT_IO),

        CryptoConfig(_) | MalformedKeyBundle | MalformedId { .. } | MissingSchemaId(_)
        | DuplicateMasterSecret | DuplicateMetadata | MissingMetadata | MalformedRecord(_)
        | MalformedTagEncoding | ProfileNotInitialized | ProfileNotFound(_)
        | ProfileKeyEncoding | MissingConfig(_) | UnsupportedVersion(_) | InvalidPassKey(_)
        | InvalidEncoding | Base58(_) | Json(_) => ExitCode::from(EXIT_SOFTWARE),
    }
}
