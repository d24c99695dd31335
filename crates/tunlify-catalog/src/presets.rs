//! Service-type catalog
//!
//! A closed set of service presets carrying advisory defaults for clients.

use serde::{Deserialize, Serialize};

use crate::tunnel::TunnelProtocol;

/// Known service types a tunnel can be created for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceType {
    Ssh,
    Rdp,
    Ftp,
    Smtp,
    Pop3,
    Imap,
    Mysql,
    Postgresql,
    Mongodb,
    Redis,
    Vnc,
    Teamviewer,
    Minecraft,
    Http,
    Https,
    Custom,
}

impl ServiceType {
    pub const ALL: [ServiceType; 16] = [
        ServiceType::Ssh,
        ServiceType::Rdp,
        ServiceType::Ftp,
        ServiceType::Smtp,
        ServiceType::Pop3,
        ServiceType::Imap,
        ServiceType::Mysql,
        ServiceType::Postgresql,
        ServiceType::Mongodb,
        ServiceType::Redis,
        ServiceType::Vnc,
        ServiceType::Teamviewer,
        ServiceType::Minecraft,
        ServiceType::Http,
        ServiceType::Https,
        ServiceType::Custom,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceType::Ssh => "ssh",
            ServiceType::Rdp => "rdp",
            ServiceType::Ftp => "ftp",
            ServiceType::Smtp => "smtp",
            ServiceType::Pop3 => "pop3",
            ServiceType::Imap => "imap",
            ServiceType::Mysql => "mysql",
            ServiceType::Postgresql => "postgresql",
            ServiceType::Mongodb => "mongodb",
            ServiceType::Redis => "redis",
            ServiceType::Vnc => "vnc",
            ServiceType::Teamviewer => "teamviewer",
            ServiceType::Minecraft => "minecraft",
            ServiceType::Http => "http",
            ServiceType::Https => "https",
            ServiceType::Custom => "custom",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|t| t.as_str() == s)
    }

    /// Default local port for this service; `None` for `custom`.
    pub fn default_port(&self) -> Option<u16> {
        match self {
            ServiceType::Ssh => Some(22),
            ServiceType::Rdp => Some(3389),
            ServiceType::Ftp => Some(21),
            ServiceType::Smtp => Some(25),
            ServiceType::Pop3 => Some(110),
            ServiceType::Imap => Some(143),
            ServiceType::Mysql => Some(3306),
            ServiceType::Postgresql => Some(5432),
            ServiceType::Mongodb => Some(27017),
            ServiceType::Redis => Some(6379),
            ServiceType::Vnc => Some(5900),
            ServiceType::Teamviewer => Some(5938),
            ServiceType::Minecraft => Some(25565),
            ServiceType::Http => Some(80),
            ServiceType::Https => Some(443),
            ServiceType::Custom => None,
        }
    }

    pub fn default_protocol(&self) -> TunnelProtocol {
        match self {
            ServiceType::Http | ServiceType::Https => TunnelProtocol::Http,
            _ => TunnelProtocol::Tcp,
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            ServiceType::Ssh => "SSH",
            ServiceType::Rdp => "Remote Desktop",
            ServiceType::Ftp => "FTP",
            ServiceType::Smtp => "SMTP",
            ServiceType::Pop3 => "POP3",
            ServiceType::Imap => "IMAP",
            ServiceType::Mysql => "MySQL",
            ServiceType::Postgresql => "PostgreSQL",
            ServiceType::Mongodb => "MongoDB",
            ServiceType::Redis => "Redis",
            ServiceType::Vnc => "VNC",
            ServiceType::Teamviewer => "TeamViewer",
            ServiceType::Minecraft => "Minecraft",
            ServiceType::Http => "HTTP",
            ServiceType::Https => "HTTPS",
            ServiceType::Custom => "Custom",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            ServiceType::Ssh => "Secure shell access to a remote machine",
            ServiceType::Rdp => "Windows Remote Desktop Protocol",
            ServiceType::Ftp => "File transfer",
            ServiceType::Smtp => "Outgoing mail server",
            ServiceType::Pop3 => "Incoming mail (POP3)",
            ServiceType::Imap => "Incoming mail (IMAP)",
            ServiceType::Mysql => "MySQL database server",
            ServiceType::Postgresql => "PostgreSQL database server",
            ServiceType::Mongodb => "MongoDB database server",
            ServiceType::Redis => "Redis key-value store",
            ServiceType::Vnc => "VNC remote desktop",
            ServiceType::Teamviewer => "TeamViewer remote access",
            ServiceType::Minecraft => "Minecraft game server",
            ServiceType::Http => "Plain HTTP web server",
            ServiceType::Https => "HTTPS web server",
            ServiceType::Custom => "Any TCP service on a custom port",
        }
    }
}
