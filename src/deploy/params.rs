//! Container creation parameters.

use super::{DeployError, DeploymentRecord, Result, RunState};
use crate::env::labels;
use crate::runtime::{CreateContainerSpec, PortAllocator, PortMapping, RuntimeConfig};
use tracing::warn;

/// JVM flags enabling an unauthenticated, non-SSL JMX remote on `port`.
pub fn jmx_java_opts(port: u16) -> String {
    [
        "-Dcom.sun.management.jmxremote.ssl=false".to_string(),
        "-Dcom.sun.management.jmxremote.authenticate=false".to_string(),
        format!("-Dcom.sun.management.jmxremote.port={}", port),
        format!("-Dcom.sun.management.jmxremote.rmi.port={}", port),
        "-Djava.rmi.server.hostname=localhost".to_string(),
        "-Dcom.sun.management.jmxremote.local.only=false".to_string(),
        "-Dspring.jmx.enabled=true".to_string(),
        "-Dspring.application.admin.enabled=true".to_string(),
    ]
    .join(" ")
}

/// JVM flags opening a remote debug agent on `port`.
///
/// Java 9 and later only listen on loopback unless the address names a host,
/// so `*:` is prepended there. An unknown version is treated as modern.
pub fn debug_java_opts(port: u16, java_major_version: Option<u32>) -> String {
    let address = match java_major_version {
        Some(version) if version < 9 => port.to_string(),
        _ => format!("*:{}", port),
    };
    format!(
        "-Xdebug -Xrunjdwp:server=y,transport=dt_socket,suspend=n,address={}",
        address
    )
}

/// Reject values that cannot be passed unquoted on a JVM command line.
///
/// # Errors
///
/// Returns [`DeployError::InvalidSystemProperty`] if `value` contains
/// whitespace or control characters.
pub fn validate_system_property(key: &str, value: &str) -> Result<()> {
    if value.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(DeployError::InvalidSystemProperty {
            key: key.to_string(),
            value: value.to_string(),
        });
    }
    Ok(())
}

/// Everything needed to create an application container, plus what was
/// allocated on the way.
#[derive(Debug, Clone)]
pub struct ContainerParams {
    /// Runtime creation request
    pub spec: CreateContainerSpec,
    /// Local port bound to the application port
    pub app_port: Option<u16>,
    /// Local JMX port
    pub jmx_port: Option<u16>,
    /// Local remote-debug port
    pub debug_port: Option<u16>,
    /// Combined JVM flags exported as `JAVA_OPTS`
    pub java_opts: Option<String>,
}

impl ContainerParams {
    /// Assemble creation parameters for `record` running `image`.
    ///
    /// Labels come first (app name, build id, serialized system properties),
    /// then the application port, the JMX port, the debug port when the
    /// record asks for debugging, and finally the system properties as `-D`
    /// flags. Ports that cannot be allocated are left out.
    ///
    /// # Errors
    ///
    /// Returns [`DeployError::InvalidSystemProperty`] for a property value
    /// containing whitespace or control characters.
    pub fn assemble(
        record: &DeploymentRecord,
        image: &str,
        network: &str,
        config: &RuntimeConfig,
        ports: &dyn PortAllocator,
        java_major_version: Option<u32>,
    ) -> Result<Self> {
        let mut spec = CreateContainerSpec {
            image: image.to_string(),
            network: Some(network.to_string()),
            aliases: vec![record.name.clone()],
            ..Default::default()
        };
        spec.labels = vec![
            (labels::APP_NAME.to_string(), record.name.clone()),
            (labels::BUILD_ID.to_string(), record.build_id.clone()),
            (labels::SYSTEM_PROPS.to_string(), record.system_properties_label()),
        ];
        let mut java_opts: Vec<String> = Vec::new();

        let app_port = ports.allocate();
        match app_port {
            Some(local) => {
                spec.labels
                    .push((labels::APP_LOCAL_PORT.to_string(), local.to_string()));
                publish(&mut spec, local, config.app_port);
            }
            None => warn!("No free port for {}, application port not published", record.name),
        }

        let jmx_port = if config.jmx_enabled { ports.allocate() } else { None };
        if let Some(port) = jmx_port {
            spec.labels.push((labels::JMX_PORT.to_string(), port.to_string()));
            publish(&mut spec, port, port);
            java_opts.push(jmx_java_opts(port));
        } else if config.jmx_enabled {
            warn!("No free port for {}, JMX disabled", record.name);
        }

        let debug_port = if record.desired_run_state == RunState::Debugging {
            let port = ports.allocate();
            if port.is_none() {
                warn!("No free port for {}, debugging disabled", record.name);
            }
            port
        } else {
            None
        };
        if let Some(port) = debug_port {
            spec.labels.push((labels::DEBUG_PORT.to_string(), port.to_string()));
            publish(&mut spec, port, port);
            java_opts.push(debug_java_opts(port, java_major_version));
        }

        for (key, value) in &record.system_properties {
            validate_system_property(key, value)?;
            java_opts.push(format!("-D{}={}", key, value));
        }

        let java_opts = (!java_opts.is_empty()).then(|| java_opts.join(" "));
        if let Some(opts) = &java_opts {
            spec.env.push(format!("JAVA_OPTS={}", opts));
        }

        Ok(Self {
            spec,
            app_port,
            jmx_port,
            debug_port,
            java_opts,
        })
    }
}

fn publish(spec: &mut CreateContainerSpec, host_port: u16, container_port: u16) {
    let mapping = PortMapping::any_interface(host_port, container_port);
    spec.exposed_ports.push(mapping.container_port_key());
    spec.port_bindings.push(mapping);
}
