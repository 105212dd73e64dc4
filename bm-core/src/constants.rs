//! Constants and configuration defaults for bootmeta
//!
//! Paths, firmware signatures and timing defaults used across the crate.

use std::time::Duration;

/// System paths
pub mod paths {
    /// Operator settings file
    pub const SETTINGS_FILE: &str = "/etc/bootmeta/bootmeta.json";

    /// Environment variable overriding the settings file location
    pub const SETTINGS_ENV: &str = "BOOTMETA_CONFIG";

    /// Local seed directory (one subdirectory per platform)
    pub const SEED_DIR: &str = "/var/lib/cloud/seed";

    /// Persistent state directory for cached platform documents
    pub const CACHE_DIR: &str = "/var/lib/bootmeta";

    /// Azure agent state directory; also the cache for `ovf-env.xml`
    pub const AZURE_DATA_DIR: &str = "/var/lib/waagent";

    /// Stable link to the Azure resource (ephemeral) disk
    pub const AZURE_RESOURCE_DISK: &str = "/dev/disk/cloud/azure_resource";

    /// Temporary mount points for candidate volumes
    pub const MOUNT_ROOT: &str = "/run/bootmeta/mnt";

    /// DMI attributes exported by the kernel
    pub const DMI_DIR: &str = "sys/class/dmi/id";

    /// Xen hypervisor uuid
    pub const HYPERVISOR_UUID: &str = "sys/hypervisor/uuid";

    /// Network interfaces
    pub const NET_CLASS_DIR: &str = "sys/class/net";

    /// SmartOS metadata serial port (KVM brand)
    pub const SMARTOS_SERIAL_DEVICE: &str = "/dev/ttyS1";

    /// Scripts run on every boot by the guest's boot hooks
    pub const PER_BOOT_SCRIPTS_DIR: &str = "/var/lib/cloud/scripts/per-boot";
}

/// Firmware strings identifying platforms
pub mod signatures {
    pub const AZURE_CHASSIS_ASSET_TAG: &str = "7783-7084-3265-9085-8269-3286-77";
    pub const ALIYUN_PRODUCT_NAME: &str = "Alibaba Cloud ECS";
    pub const SMARTOS_PRODUCT_PREFIX: &str = "SmartDC";
    pub const EC2_UUID_PREFIX: &str = "ec2";
    pub const BRIGHTBOX_SERIAL_SUFFIX: &str = ".brightbox.com";
}

/// Metadata service defaults
pub mod metadata {
    pub const EC2_METADATA_URLS: &[&str] = &["http://169.254.169.254", "http://instance-data.:8773"];
    pub const EC2_API_VERSION: &str = "2009-04-04";
    pub const ALIYUN_METADATA_URLS: &[&str] = &["http://100.100.100.200"];
    pub const ALIYUN_API_VERSION: &str = "2016-01-01";

    /// Maximum depth of a crawled metadata tree
    pub const MAX_TREE_DEPTH: usize = 8;

    /// Default instance ids when the platform does not provide one
    pub const AZURE_DEFAULT_INSTANCE_ID: &str = "iid-AZURE-NODE";
    pub const OVF_DEFAULT_INSTANCE_ID: &str = "iid-dsovf";
    pub const NONE_INSTANCE_ID: &str = "iid-datasource-none";

    /// SmartOS keys whose values may arrive base64 encoded
    pub const SMARTOS_BASE64_DECODABLE: &[&str] = &[
        "hostname",
        "root_authorized_keys",
        "user-script",
        "user-data",
        "cloud-init:user-data",
        "iptables_disable",
        "motd_sys_info",
        "sdc:datacenter_name",
        "sdc:vendor-data",
        "sdc:operator-script",
        "sdc:uuid",
    ];

    /// SmartOS keys never base64 decoded unless the operator says otherwise
    pub const SMARTOS_NO_BASE64_DECODE: &[&str] = &[
        "root_authorized_keys",
        "motd_sys_info",
        "iptables_disable",
        "user-data",
        "user-script",
        "sdc:datacenter_name",
        "sdc:uuid",
    ];
}

/// Volume document names
pub mod volumes {
    /// Names tried, in order, for an OVF environment document
    pub const OVF_ENV_NAMES: &[&str] = &["ovf-env.xml", "ovf_env.xml", "OVF_ENV.XML", "OVF-ENV.XML"];

    /// Azure only ever writes the lowercase name
    pub const AZURE_ENV_NAMES: &[&str] = &["ovf-env.xml"];

    /// Device names that can carry an OVF transport cdrom
    pub const CDROM_DEVICE_PATTERN: &str = r"^(sr[0-9]+|hd[a-z]|xvd.*)";
}

/// Timing defaults
pub mod timing {
    use super::Duration;

    /// Total time to wait for a metadata service
    pub const METADATA_MAX_WAIT: Duration = Duration::from_secs(120);

    /// Per-request timeout against a metadata service
    pub const METADATA_TIMEOUT: Duration = Duration::from_secs(50);

    /// Pause between metadata service polls
    pub const METADATA_RETRY_INTERVAL: Duration = Duration::from_secs(2);

    /// Read timeout applied to the serial port
    pub const SERIAL_READ_TIMEOUT: Duration = Duration::from_secs(60);

    /// Upper bound for any configured wait
    pub const MAX_CONFIGURED_WAIT: Duration = Duration::from_secs(3600);
}
