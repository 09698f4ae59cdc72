//! Persists the most recently successful discovery address across runs.
//! Plain newline-separated list of addresses, most recent last — not
//! worth a serialization crate.

use std::fs;
use std::net::Ipv4Addr;
use std::path::Path;

pub fn load_last_known_servers(path: &Path) -> Vec<Ipv4Addr> {
    let Ok(contents) = fs::read_to_string(path) else {
        return Vec::new();
    };
    contents.lines().filter_map(|line| line.trim().parse().ok()).collect()
}

pub fn save_last_known_server(path: &Path, addr: Ipv4Addr) -> std::io::Result<()> {
    let mut servers = load_last_known_servers(path);
    servers.retain(|&a| a != addr);
    servers.insert(0, addr);
    servers.truncate(8);

    let body = servers.iter().map(Ipv4Addr::to_string).collect::<Vec<_>>().join("\n");
    fs::write(path, body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_a_temp_file() {
        let path = std::env::temp_dir().join(format!("netsync-last-known-{}.txt", std::process::id()));
        save_last_known_server(&path, Ipv4Addr::new(10, 0, 0, 1)).unwrap();
        save_last_known_server(&path, Ipv4Addr::new(10, 0, 0, 2)).unwrap();

        let loaded = load_last_known_servers(&path);
        assert_eq!(loaded, vec![Ipv4Addr::new(10, 0, 0, 2), Ipv4Addr::new(10, 0, 0, 1)]);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn missing_file_yields_empty_list() {
        let path = Path::new("/nonexistent/netsync-last-known.txt");
        assert!(load_last_known_servers(path).is_empty());
    }
}
