//! Values exposed to stack templates

use serde::Serialize;

use crate::config::{StackConfig, StackSecrets};

/// UDP relay range coturn hands out to clients
pub const TURN_MIN_PORT: u16 = 49152;
pub const TURN_MAX_PORT: u16 = 65535;

/// Flat view of the stack config and secrets, one field per template variable
#[derive(Debug, Serialize)]
pub struct TemplateContext<'a> {
    pub domain: &'a str,
    pub acme_email: &'a str,
    pub netbird_version: &'a str,
    pub dashboard_version: &'a str,
    pub client_id: &'a str,
    pub authority: String,
    pub scopes: String,
    pub relay_secret: &'a str,
    pub turn_password: &'a str,
    pub turn_min_port: u16,
    pub turn_max_port: u16,
}

impl<'a> TemplateContext<'a> {
    pub fn new(stack: &'a StackConfig, secrets: &'a StackSecrets) -> Self {
        Self {
            domain: &stack.domain,
            acme_email: &stack.acme_email,
            netbird_version: &stack.netbird_version,
            dashboard_version: &stack.dashboard_version,
            client_id: &stack.idp.client_id,
            authority: stack.authority(),
            scopes: pkce_scopes(&stack.idp.client_id),
            relay_secret: &secrets.relay_secret,
            turn_password: &secrets.turn_password,
            turn_min_port: TURN_MIN_PORT,
            turn_max_port: TURN_MAX_PORT,
        }
    }
}

/// Scopes requested by the dashboard and CLI PKCE flow
pub fn pkce_scopes(client_id: &str) -> String {
    format!("openid profile email offline_access api://{}/api", client_id)
}
