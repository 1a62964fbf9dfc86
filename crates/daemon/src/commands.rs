// Kube Tunnel Manager - Command Planning Module
// Translates tunnel configuration into the external command lines to spawn

use kube_tunnel_common::TunnelConfig;

/// Process signature patterns used by the bulk-kill sweep
///
/// These match any forward or relay process spawned by this daemon (or a
/// previous, crashed instance whose handles were lost).
pub const FORWARD_SIGNATURE: &str = "kubectl port-forward";
pub const RELAY_SIGNATURE: &str = "socat TCP-LISTEN";

/// An external command ready to be spawned
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnSpec {
    pub program: String,
    pub args: Vec<String>,
}

impl SpawnSpec {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

impl std::fmt::Display for SpawnSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.program, self.args.join(" "))
    }
}

/// Translates tunnel configuration into spawn specs
///
/// This is the seam between the supervisor and the concrete external tools;
/// tests substitute inert commands through it.
pub trait SpawnPlanner: Send + Sync {
    /// Command for the forward stage, or None when the tunnel runs without a
    /// discrete forward process (direct-exec mode)
    fn forward_spec(&self, config: &TunnelConfig) -> Option<SpawnSpec>;

    /// Command for the relay stage, or None when no relay is configured
    fn relay_spec(&self, config: &TunnelConfig) -> Option<SpawnSpec>;
}

/// Production planner: kubectl for the forward stage, socat for the relay
pub struct KubectlPlanner {
    kubectl_path: String,
}

impl KubectlPlanner {
    pub fn new(kubectl_path: impl Into<String>) -> Self {
        Self {
            kubectl_path: kubectl_path.into(),
        }
    }

    /// Per-connection helper run by the direct-exec relay
    ///
    /// Each inbound client gets its own upstream session: derive a candidate
    /// port from the handler shell's PID, probe-and-increment past ports in
    /// use, launch a fresh port-forward on it, wait for the listener with
    /// bounded retries (10 x 0.5s), then splice stdio onto it. The session is
    /// torn down when the client connection closes.
    ///
    /// Commas are option separators inside socat addresses and must not
    /// appear in the script.
    fn direct_exec_script(&self, config: &TunnelConfig) -> String {
        format!(
            "port=$((20000 + $$ % 10000)); \
             while nc -z 127.0.0.1 $port >/dev/null 2>&1; do port=$((port + 1)); done; \
             {kubectl} port-forward -n {namespace} service/{service} $port:{remote} --address 127.0.0.1 >/dev/null 2>&1 & \
             pf=$!; \
             tries=0; \
             until nc -z 127.0.0.1 $port >/dev/null 2>&1; do \
             tries=$((tries + 1)); \
             if [ $tries -ge 10 ]; then kill $pf; exit 1; fi; \
             sleep 0.5; \
             done; \
             socat - TCP:127.0.0.1:$port; \
             kill $pf",
            kubectl = self.kubectl_path,
            namespace = config.namespace,
            service = config.service,
            remote = config.remote_port,
        )
    }
}

impl Default for KubectlPlanner {
    fn default() -> Self {
        Self::new("kubectl")
    }
}

impl SpawnPlanner for KubectlPlanner {
    fn forward_spec(&self, config: &TunnelConfig) -> Option<SpawnSpec> {
        if config.use_direct_exec {
            // The relay opens its own upstream sessions per connection
            return None;
        }

        Some(SpawnSpec::new(
            self.kubectl_path.clone(),
            vec![
                "port-forward".to_string(),
                "-n".to_string(),
                config.namespace.clone(),
                format!("service/{}", config.service),
                format!("{}:{}", config.local_port, config.remote_port),
                "--address".to_string(),
                "127.0.0.1".to_string(),
            ],
        ))
    }

    fn relay_spec(&self, config: &TunnelConfig) -> Option<SpawnSpec> {
        let proxy_port = config.proxy_port?;

        if config.use_direct_exec {
            Some(SpawnSpec::new(
                "socat",
                vec![
                    format!("TCP-LISTEN:{},reuseaddr,fork", proxy_port),
                    format!("SYSTEM:{}", self.direct_exec_script(config)),
                ],
            ))
        } else {
            // Fan-out: many local clients share the single forward channel
            Some(SpawnSpec::new(
                "socat",
                vec![
                    format!("TCP-LISTEN:{},reuseaddr,fork", proxy_port),
                    format!("TCP:127.0.0.1:{}", config.local_port),
                ],
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> TunnelConfig {
        TunnelConfig::new(
            "web".to_string(),
            "default".to_string(),
            "web-svc".to_string(),
            8080,
            80,
        )
    }

    #[test]
    fn forward_spec_encodes_ports_and_target() {
        let planner = KubectlPlanner::default();
        let spec = planner.forward_spec(&config()).unwrap();

        assert_eq!(spec.program, "kubectl");
        assert!(spec.args.contains(&"port-forward".to_string()));
        assert!(spec.args.contains(&"service/web-svc".to_string()));
        assert!(spec.args.contains(&"8080:80".to_string()));
        assert!(spec.args.contains(&"127.0.0.1".to_string()));
    }

    #[test]
    fn no_relay_spec_without_proxy_port() {
        let planner = KubectlPlanner::default();
        assert!(planner.relay_spec(&config()).is_none());
    }

    #[test]
    fn standard_relay_fans_out_to_local_port() {
        let planner = KubectlPlanner::default();
        let mut config = config();
        config.proxy_port = Some(8079);

        let spec = planner.relay_spec(&config).unwrap();
        assert_eq!(spec.program, "socat");
        assert_eq!(spec.args[0], "TCP-LISTEN:8079,reuseaddr,fork");
        assert_eq!(spec.args[1], "TCP:127.0.0.1:8080");
    }

    #[test]
    fn direct_exec_has_no_forward_process() {
        let planner = KubectlPlanner::default();
        let mut config = config();
        config.proxy_port = Some(9000);
        config.use_direct_exec = true;

        assert!(planner.forward_spec(&config).is_none());

        let relay = planner.relay_spec(&config).unwrap();
        assert_eq!(relay.program, "socat");
        assert!(relay.args[1].starts_with("SYSTEM:"));
        // Per-connection upstream session with bounded readiness retries
        assert!(relay.args[1].contains("port-forward"));
        assert!(relay.args[1].contains("-ge 10"));
        // Commas would split the socat address spec
        assert!(!relay.args[1].contains(','));
    }
}
