use ahash::AHashMap;

/// Maps arbitrary port-key strings (as seen in URLs, where only numeric ports
/// are legal) onto the canonical port keys a [`crate::node::Port`] is tagged
/// with. Multiple canonical keys may be listed comma-separated; a connection
/// tries each in order until one matches a port on the current node.
///
/// Default table, identical to `fd_pool.c`'s `default_upmap`:
/// `80,443 -> http_port`, `8080 -> port`, `8081 -> controller_port`,
/// `8082 -> keepalive_port,port`, `8180 -> plog_port`, empty -> `port`.
#[derive(Debug, Clone)]
pub struct PortMap {
    table: AHashMap<String, String>,
}

impl Default for PortMap {
    fn default() -> Self {
        let mut table = AHashMap::new();
        table.insert("80".to_string(), "http_port".to_string());
        table.insert("443".to_string(), "http_port".to_string());
        table.insert("8080".to_string(), "port".to_string());
        table.insert("8081".to_string(), "controller_port".to_string());
        table.insert("8082".to_string(), "keepalive_port,port".to_string());
        table.insert("8180".to_string(), "plog_port".to_string());
        Self { table }
    }
}

impl PortMap {
    pub fn new() -> Self {
        Self {
            table: AHashMap::new(),
        }
    }

    pub fn insert(&mut self, from: impl Into<String>, to: impl Into<String>) {
        self.table.insert(from.into(), to.into());
    }

    /// Look up a raw port-key, falling back to `"port"` for an empty key and
    /// to the key itself when it isn't present in the table.
    pub fn lookup<'a>(&'a self, port_key: &'a str) -> &'a str {
        if port_key.is_empty() {
            return "port";
        }
        self.table
            .get(port_key)
            .map(|s| s.as_str())
            .unwrap_or(port_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_table_matches_original() {
        let m = PortMap::default();
        assert_eq!(m.lookup("80"), "http_port");
        assert_eq!(m.lookup("443"), "http_port");
        assert_eq!(m.lookup("8080"), "port");
        assert_eq!(m.lookup("8081"), "controller_port");
        assert_eq!(m.lookup("8082"), "keepalive_port,port");
        assert_eq!(m.lookup("8180"), "plog_port");
        assert_eq!(m.lookup(""), "port");
        assert_eq!(m.lookup("unmapped_port"), "unmapped_port");
    }

    #[test]
    fn fallback_key_list_tries_each_in_order() {
        let m = PortMap::default();
        let keys: Vec<&str> = m.lookup("8082").split(',').collect();
        assert_eq!(keys, vec!["keepalive_port", "port"]);
    }
}
