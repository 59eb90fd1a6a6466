// ABOUTME: postgresql.conf rendering for the two instances
// ABOUTME: Both share identical logical-replication tuning and differ only in port, listen address and log naming

use std::net::IpAddr;
use std::path::Path;

use crate::config::InstanceDescriptor;

/// Settings identical on both instances.
const SHARED_SETTINGS: &[(&str, &str)] = &[
    ("wal_level", "logical"),
    ("max_replication_slots", "10"),
    ("max_wal_senders", "10"),
    ("max_logical_replication_workers", "4"),
    ("max_worker_processes", "16"),
    ("shared_buffers", "256MB"),
    ("work_mem", "16MB"),
    ("maintenance_work_mem", "128MB"),
    ("effective_cache_size", "1GB"),
    ("wal_compression", "on"),
    ("max_connections", "100"),
    ("logging_collector", "on"),
    ("log_rotation_age", "1d"),
    ("log_rotation_size", "0"),
    ("log_truncate_on_rotation", "on"),
    ("log_line_prefix", "'%m [%p] %q%u@%d '"),
];

pub fn log_filename(instance: &InstanceDescriptor, version: u32) -> String {
    format!("postgresql-{}-{}-%a.log", version, instance.role)
}

/// `localhost`, plus the instance's own address unless it is loopback.
pub fn listen_addresses(instance: &InstanceDescriptor) -> String {
    let loopback = match instance.host.parse::<IpAddr>() {
        Ok(addr) => addr.is_loopback(),
        Err(_) => instance.host == "localhost",
    };
    if loopback {
        "localhost".to_string()
    } else {
        format!("localhost,{}", instance.host)
    }
}

pub fn render_postgresql_conf(
    instance: &InstanceDescriptor,
    version: u32,
    log_dir: &Path,
    socket_dir: &Path,
) -> String {
    let mut out = format!(
        "# Managed by pg-bidi-setup for the {} instance.\n\n",
        instance.role
    );

    let per_instance = [
        ("port", instance.port.to_string()),
        ("listen_addresses", quote(&listen_addresses(instance))),
        ("unix_socket_directories", quote(&socket_dir.display().to_string())),
        ("log_directory", quote(&log_dir.display().to_string())),
        ("log_filename", quote(&log_filename(instance, version))),
    ];
    for (key, value) in &per_instance {
        out.push_str(&format!("{} = {}\n", key, value));
    }

    out.push('\n');
    for (key, value) in SHARED_SETTINGS {
        out.push_str(&format!("{} = {}\n", key, value));
    }
    out
}

fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{InstanceRole, Topology};
    use std::collections::BTreeMap;

    fn settings(conf: &str) -> BTreeMap<String, String> {
        conf.lines()
            .filter(|line| !line.starts_with('#'))
            .filter_map(|line| line.split_once(" = "))
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn render(role: InstanceRole, host: &str) -> String {
        let instance =
            Topology::default().instance(role, Some(host), Path::new("/var/lib/postgresql/15"));
        render_postgresql_conf(
            &instance,
            15,
            Path::new("/var/log/postgresql"),
            Path::new("/var/run/postgresql"),
        )
    }

    #[test]
    fn test_instances_differ_only_in_port_listen_and_log_name() {
        let main = settings(&render(InstanceRole::Main, "10.0.0.1"));
        let second = settings(&render(InstanceRole::Second, "10.0.0.2"));

        let differing: Vec<&str> = main
            .keys()
            .filter(|key| main[*key] != second[*key])
            .map(String::as_str)
            .collect();
        assert_eq!(differing, vec!["listen_addresses", "log_filename", "port"]);

        assert_eq!(main["port"], "5432");
        assert_eq!(second["port"], "5433");
        assert_eq!(main["wal_level"], "logical");
        assert_eq!(second["log_filename"], "'postgresql-15-second-%a.log'");
        assert_eq!(main["listen_addresses"], "'localhost,10.0.0.1'");
    }

    #[test]
    fn test_loopback_hosts_listen_on_localhost_only() {
        let conf = settings(&render(InstanceRole::Main, "127.0.0.1"));
        assert_eq!(conf["listen_addresses"], "'localhost'");
    }
}
