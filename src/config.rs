use figment::{
    providers::{Env, Format, Json, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Name of the Docker network to manage.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network_name: Option<String>,
    /// Id or name of the daemon's own container.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub self_id: Option<String>,
    /// Externally reachable interface virtual IPs are bound to.
    pub host_iface: String,
    /// Directory where container network namespaces are exposed.
    pub netns_dir: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            network_name: None,
            self_id: None,
            host_iface: "eth0".into(),
            netns_dir: "/var/run/netns".into(),
        }
    }
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let mut config: Config = Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file("ipvsnet.toml"))
            .merge(Json::file("ipvsnet.json"))
            .merge(Env::prefixed("IPVSNET_"))
            .extract()
            .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;

        // Positional arguments take precedence: the network name and,
        // optionally, an identifier for our own container.
        let mut args = std::env::args().skip(1);
        if let Some(network) = args.next() {
            config.network_name = Some(network);
        }
        if let Some(self_id) = args.next() {
            config.self_id = Some(self_id);
        }

        // Inside a container the hostname is the container id.
        if config.self_id.is_none() {
            config.self_id = std::env::var("HOSTNAME").ok();
        }

        Ok(config)
    }
}
