//! Synthetic SQL credentials handed to agents at registration
//!
//! The relay never uses these itself; the agent provisions them on the
//! customer's SQL Server so external clients can log in through the tunnel.

use rand::distributions::Alphanumeric;
use rand::rngs::OsRng;
use rand::Rng;

/// Length of generated SQL passwords
const PASSWORD_LEN: usize = 24;

/// Derive the SQL login name for a tenant: `tatbeeb_` + first 6 chars of the id
pub fn sql_user(tenant_id: &str) -> String {
    let prefix: String = tenant_id.chars().take(6).collect();
    format!("tatbeeb_{}", prefix)
}

/// Generate a random alphanumeric SQL password from the OS RNG
pub fn generate_password() -> String {
    OsRng
        .sample_iter(&Alphanumeric)
        .take(PASSWORD_LEN)
        .map(char::from)
        .collect()
}

/// Pre-formatted SQL Server DSN pointing at the tenant's public port
pub fn connection_string(public_host: &str, port: u16, user: &str, password: &str) -> String {
    format!(
        "Server={},{};Encrypt=True;TrustServerCertificate=False;User Id={};Password={};",
        public_host, port, user, password
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sql_user_truncates_tenant_id() {
        assert_eq!(sql_user("clinic-riyadh-001"), "tatbeeb_clinic");
    }

    #[test]
    fn test_sql_user_short_tenant_id() {
        assert_eq!(sql_user("ab"), "tatbeeb_ab");
    }

    #[test]
    fn test_password_shape() {
        let pw = generate_password();
        assert_eq!(pw.len(), PASSWORD_LEN);
        assert!(pw.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn test_passwords_are_unique() {
        assert_ne!(generate_password(), generate_password());
    }

    #[test]
    fn test_connection_string_format() {
        let dsn = connection_string("link.tatbeeb.sa", 50001, "tatbeeb_clinic", "s3cret");
        assert_eq!(
            dsn,
            "Server=link.tatbeeb.sa,50001;Encrypt=True;TrustServerCertificate=False;User Id=tatbeeb_clinic;Password=s3cret;"
        );
    }
}
