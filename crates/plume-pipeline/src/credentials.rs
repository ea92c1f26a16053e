//! Credential lookup for the worker.

use chrono::{DateTime, Utc};
use plume_providers::Credential;
use plume_store::{AccountStore, LinkedAccount, StoreError};

/// Read-only source of channel credentials.
pub trait CredentialStore: Send + Sync {
    fn get_credential(&self, owner_id: &str, channel: &str)
    -> Result<Option<Credential>, StoreError>;
}

impl CredentialStore for AccountStore {
    fn get_credential(
        &self,
        owner_id: &str,
        channel: &str,
    ) -> Result<Option<Credential>, StoreError> {
        Ok(self.get(owner_id, channel)?.map(credential_from))
    }
}

fn credential_from(account: LinkedAccount) -> Credential {
    Credential {
        channel: account.channel,
        account_id: account.account_id,
        access_token: account.access_token,
        refresh_token: account.refresh_token,
        secret: account.secret,
        expires_at: account.expires_at,
    }
}

/// Build a linked account record, as the CLI and tests do.
pub fn linked_account(
    owner_id: &str,
    credential: &Credential,
    now: DateTime<Utc>,
) -> LinkedAccount {
    LinkedAccount {
        owner_id: owner_id.to_string(),
        channel: credential.channel.clone(),
        account_id: credential.account_id.clone(),
        access_token: credential.access_token.clone(),
        refresh_token: credential.refresh_token.clone(),
        secret: credential.secret.clone(),
        expires_at: credential.expires_at,
        linked_at: now,
        updated_at: now,
    }
}
