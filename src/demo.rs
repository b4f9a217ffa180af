//! Offline demo accounts

use uuid::Uuid;

use crate::user::{normalize_email, Role, User};

/// One statically configured demo credential
#[derive(Debug, Clone)]
pub struct DemoAccount {
    pub email: String,
    pub password: String,
    pub role: Role,
}

impl DemoAccount {
    pub fn new(email: &str, password: &str, role: Role) -> Self {
        Self {
            email: normalize_email(email),
            password: password.to_string(),
            role,
        }
    }
}

/// Pure lookup of demo credentials, consulted before the remote provider
#[derive(Debug, Clone)]
pub struct DemoCredentialResolver {
    accounts: Vec<DemoAccount>,
}

impl Default for DemoCredentialResolver {
    fn default() -> Self {
        Self::new(vec![
            DemoAccount::new("admin@r3alm.com", "admin123", Role::Admin),
            DemoAccount::new("editor@r3alm.com", "editor123", Role::Editor),
            DemoAccount::new("user@r3alm.com", "user123", Role::User),
        ])
    }
}

impl DemoCredentialResolver {
    pub fn new(accounts: Vec<DemoAccount>) -> Self {
        Self { accounts }
    }

    /// A resolver that never matches.
    pub fn disabled() -> Self {
        Self::new(Vec::new())
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }

    /// A fresh demo `User` when the credentials match an entry.
    pub fn resolve(&self, email: &str, password: &str) -> Option<User> {
        let email = normalize_email(email);
        self.accounts
            .iter()
            .find(|account| account.email == email && account.password == password)
            .map(|account| User {
                id: format!("demo-{}", Uuid::new_v4()),
                email: account.email.clone(),
                role: account.role,
                display_name: Some(format!("{} User", account.role.capitalized())),
            })
    }
}
