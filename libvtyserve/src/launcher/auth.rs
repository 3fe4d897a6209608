// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The `Auth` service policy prompts for a username and password before
//! handing a shell to whichever local account they name. Verifying that
//! password is pluggable: the `pam` feature backs it with the system
//! PAM stack, and the fallback build refuses every login rather than
//! silently accepting one, since shipping a server that treats "no PAM"
//! as "no password required" would be a much worse default.

pub trait Authenticator {
    /// Returns the resolved uid on success. Any `Err` (bad password,
    /// unknown user, PAM misconfiguration) is treated identically by
    /// the caller: the connection is refused.
    fn authenticate(&self, username: &str, password: &str) -> anyhow::Result<u32>;
}

pub struct RefusingAuthenticator;

impl Authenticator for RefusingAuthenticator {
    fn authenticate(&self, _username: &str, _password: &str) -> anyhow::Result<u32> {
        Err(anyhow::anyhow!("this build was compiled without the 'pam' feature; the Auth service policy is disabled"))
    }
}

#[cfg(feature = "pam")]
pub struct PamAuthenticator {
    pub service_name: String,
}

#[cfg(feature = "pam")]
impl Authenticator for PamAuthenticator {
    fn authenticate(&self, username: &str, password: &str) -> anyhow::Result<u32> {
        use pam_client::{conv_mock::Conversation, Context, Flag};

        let mut context = Context::new(&self.service_name, Some(username), Conversation::with_credentials(username, password))
            .map_err(|e| anyhow::anyhow!("initializing pam context: {}", e))?;
        context.authenticate(Flag::NONE).map_err(|e| anyhow::anyhow!("pam authentication failed: {}", e))?;
        context.acct_mgmt(Flag::NONE).map_err(|e| anyhow::anyhow!("pam account check failed: {}", e))?;

        crate::user::by_name(username).map(|info| info.uid)
    }
}

pub fn default_authenticator() -> Box<dyn Authenticator> {
    #[cfg(feature = "pam")]
    {
        Box::new(PamAuthenticator { service_name: "vtyserve".to_string() })
    }
    #[cfg(not(feature = "pam"))]
    {
        Box::new(RefusingAuthenticator)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn refusing_authenticator_rejects_everything() {
        let auth = RefusingAuthenticator;
        assert!(auth.authenticate("root", "anything").is_err());
    }
}
