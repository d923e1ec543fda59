#[cfg(test)]
mod tests {
    use super::super::*;
    use once_cell::sync::Lazy;
    use std::sync::Mutex;

    // Environment variables are process-global; serialize tests that mutate
    // them so they don't interleave.
    static ENV_GUARD: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

    fn clear_all() {
        for key in [
            "MAILSERVER_SMTP_BIND_ADDRESS",
            "MAILSERVER_SMTP_PORT",
            "MAILSERVER_POP3_BIND_ADDRESS",
            "MAILSERVER_POP3_PORT",
            "MAILSERVER_TLS_CERT_PATH",
            "MAILSERVER_TLS_KEY_PATH",
            "MAILSERVER_SASL_MECHANISMS",
            "MAILSERVER_DNS_SERVERS",
            "MAILSERVER_DNS_QUERY_TIMEOUT_MS",
            "MAILSERVER_DNS_CACHE_CAPACITY",
            "MAILSERVER_HOSTS_FILE",
            "MAILSERVER_MAX_MESSAGE_SIZE",
        ] {
            env::remove_var(key);
        }
    }

    #[test]
    fn default_values_are_used_when_unset() {
        let _guard = ENV_GUARD.lock().unwrap();
        clear_all();

        let config = Config::from_env().expect("defaults alone must be sufficient");

        assert_eq!(config.smtp_bind_address, "0.0.0.0");
        assert_eq!(config.smtp_port, 2525);
        assert_eq!(config.pop3_bind_address, "0.0.0.0");
        assert_eq!(config.pop3_port, 1100);
        assert_eq!(config.sasl_mechanisms, vec!["PLAIN", "LOGIN"]);
        assert_eq!(config.dns_servers, vec!["1.1.1.1:53", "8.8.8.8:53"]);
        assert_eq!(config.hosts_file_path, "/etc/hosts");
        assert!(config.tls_cert_path.is_none());
    }

    #[test]
    fn overrides_from_env_take_effect() {
        let _guard = ENV_GUARD.lock().unwrap();
        clear_all();

        env::set_var("MAILSERVER_SMTP_PORT", "25");
        env::set_var("MAILSERVER_POP3_PORT", "110");
        env::set_var("MAILSERVER_SASL_MECHANISMS", "CRAM-MD5, PLAIN");
        env::set_var("MAILSERVER_DNS_SERVERS", "9.9.9.9:53");

        let config = Config::from_env().expect("overrides must parse");

        assert_eq!(config.smtp_port, 25);
        assert_eq!(config.pop3_port, 110);
        assert_eq!(config.sasl_mechanisms, vec!["CRAM-MD5", "PLAIN"]);
        assert_eq!(config.dns_servers, vec!["9.9.9.9:53"]);

        clear_all();
    }

    #[test]
    fn invalid_port_is_rejected() {
        let _guard = ENV_GUARD.lock().unwrap();
        clear_all();
        env::set_var("MAILSERVER_SMTP_PORT", "not-a-port");

        let result = Config::from_env();
        assert!(result.is_err());

        clear_all();
    }
}
