// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! Request bodies accepted by the job-producing endpoints, and the checks run on them before
//! anything is queued.

use std::{collections::BTreeMap, sync::LazyLock};

use {
    regex::Regex,
    serde::{Deserialize, Serialize},
    serde_json::{Map, Value},
};

use crate::chain::is_valid_segment;

static ENV_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new("^[a-zA-Z_][a-zA-Z0-9_]*$").unwrap());

static DISK_SIZE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new("^[0-9]+[KMGTkmgt]?$").unwrap());

static COMPONENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9_.-]+$").unwrap());

/// Project, VM, jail and metadata names all share the chain segment grammar.
pub fn validate_name(what: &str, name: &str) -> Result<(), String> {
    if is_valid_segment(name) {
        Ok(())
    } else {
        Err(format!(
            "invalid {what} '{name}': must match {}",
            crate::chain::SEGMENT_PATTERN
        ))
    }
}

fn validate_env_names<'a>(
    what: &str,
    names: impl IntoIterator<Item = &'a String>,
) -> Result<(), String> {
    for name in names {
        if !ENV_NAME.is_match(name) {
            return Err(format!("invalid {what} name '{name}'"));
        }
    }
    Ok(())
}

fn non_empty(field: &str, value: &str) -> Result<(), String> {
    if value.trim().is_empty() {
        Err(format!("'{field}' must not be empty"))
    } else {
        Ok(())
    }
}

/// Ports to pick before launching a project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReservePort {
    /// Interface whose address the ports are bound on.
    #[serde(default)]
    pub interface: Option<String>,
    /// Restrict the interface addresses to this network.
    #[serde(default)]
    pub address: Option<String>,
    /// Names of the ports; each becomes `OVERLORD_PORT_<NAME>` in the launcher's environment.
    pub ports: Vec<String>,
}

impl ReservePort {
    pub fn validate(&self) -> Result<(), String> {
        if self.ports.is_empty() {
            return Err("'reserve_port.ports' must not be empty".to_string());
        }
        validate_env_names("port", &self.ports)?;
        if let Some(interface) = &self.interface {
            validate_name("interface", interface)?;
        }
        if let Some(address) = &self.address {
            crate::net::parse_network(address)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpRequest {
    /// Contents of the launcher's project file.
    pub director_file: String,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    #[serde(default)]
    pub restart: bool,
    #[serde(default)]
    pub reserve_port: Option<ReservePort>,
}

impl UpRequest {
    pub fn validate(&self) -> Result<(), String> {
        non_empty("director_file", &self.director_file)?;
        validate_env_names("environment", self.environment.keys())?;
        if let Some(reserve) = &self.reserve_port {
            reserve.validate()?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DownRequest {
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    /// Skip deregistration from the load balancer and DNS.
    #[serde(default)]
    pub force: bool,
}

impl DownRequest {
    pub fn validate(&self) -> Result<(), String> {
        validate_env_names("environment", self.environment.keys())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectUp {
    pub name: String,
    pub request: UpRequest,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectDown {
    pub name: String,
    pub request: DownRequest,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectCancel {
    pub name: String,
}

/// Where the VM's operating system comes from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DiskSource {
    #[serde(rename = "components")]
    Components {
        components: Vec<String>,
        #[serde(rename = "osArch")]
        os_arch: String,
        #[serde(rename = "osVersion")]
        os_version: String,
        #[serde(default, rename = "downloadURL")]
        download_url: Option<String>,
    },
    #[serde(rename = "appjailImage")]
    AppjailImage {
        entrypoint: String,
        #[serde(rename = "imageName")]
        image_name: String,
        #[serde(rename = "imageArch")]
        image_arch: String,
        #[serde(rename = "imageTag")]
        image_tag: String,
    },
    #[serde(rename = "iso")]
    Iso {
        #[serde(rename = "isoFile")]
        iso_file: String,
    },
    #[serde(rename = "img")]
    Img {
        #[serde(rename = "imgFile")]
        img_file: String,
    },
}

impl DiskSource {
    pub fn strategy(&self) -> &'static str {
        match self {
            DiskSource::Components { .. } => "components",
            DiskSource::AppjailImage { .. } => "appjail-image",
            DiskSource::Iso { .. } => "iso",
            DiskSource::Img { .. } => "img",
        }
    }

    /// Arguments passed to the provisioning helper after the strategy name.
    pub fn arguments(&self) -> Vec<String> {
        match self {
            DiskSource::Components {
                components,
                os_arch,
                os_version,
                download_url,
            } => {
                let mut args = vec![os_arch.clone(), os_version.clone()];
                if let Some(url) = download_url {
                    args.push("--url".to_string());
                    args.push(url.clone());
                }
                args.push("--".to_string());
                args.extend(components.iter().cloned());
                args
            }
            DiskSource::AppjailImage {
                entrypoint,
                image_name,
                image_arch,
                image_tag,
            } => vec![
                entrypoint.clone(),
                image_name.clone(),
                image_arch.clone(),
                image_tag.clone(),
            ],
            DiskSource::Iso { iso_file } => vec![iso_file.clone()],
            DiskSource::Img { img_file } => vec![img_file.clone()],
        }
    }

    fn validate(&self) -> Result<(), String> {
        match self {
            DiskSource::Components {
                components,
                os_arch,
                os_version,
                download_url,
            } => {
                if components.is_empty() {
                    return Err("'components' must not be empty".to_string());
                }
                for component in components.iter() {
                    if !COMPONENT.is_match(component) {
                        return Err(format!("invalid component '{component}'"));
                    }
                }
                non_empty("osArch", os_arch)?;
                non_empty("osVersion", os_version)?;
                if let Some(url) = download_url {
                    non_empty("downloadURL", url)?;
                }
            }
            DiskSource::AppjailImage {
                entrypoint,
                image_name,
                image_arch,
                image_tag,
            } => {
                non_empty("entrypoint", entrypoint)?;
                non_empty("imageName", image_name)?;
                non_empty("imageArch", image_arch)?;
                non_empty("imageTag", image_tag)?;
            }
            DiskSource::Iso { iso_file } => non_empty("isoFile", iso_file)?,
            DiskSource::Img { img_file } => non_empty("imgFile", img_file)?,
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DiskLayout {
    pub driver: String,
    pub size: String,
    pub from: DiskSource,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CloudInit {
    #[serde(default, rename = "meta-data")]
    pub meta_data: Map<String, Value>,
    #[serde(rename = "user-data")]
    pub user_data: String,
    #[serde(default, rename = "network-config")]
    pub network_config: Option<Value>,
}

/// The VM profile accepted by `POST /v1/vm/{name}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VmRequest {
    #[serde(default)]
    pub makejail: Option<String>,
    /// Name of a metadata entry holding the Makejail.
    #[serde(default, rename = "makejailFromMetadata")]
    pub makejail_from_metadata: Option<String>,
    /// The hypervisor template, as key/value pairs.
    pub template: BTreeMap<String, String>,
    #[serde(rename = "diskLayout")]
    pub disk_layout: DiskLayout,
    /// Script run inside the VM after provisioning.
    #[serde(default)]
    pub script: Option<String>,
    /// Files made available to the VM, by name.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(default, rename = "script-environment")]
    pub script_environment: BTreeMap<String, String>,
    #[serde(default, rename = "start-environment")]
    pub start_environment: BTreeMap<String, String>,
    #[serde(default, rename = "build-environment")]
    pub build_environment: BTreeMap<String, String>,
    #[serde(default, rename = "start-arguments")]
    pub start_arguments: BTreeMap<String, String>,
    #[serde(default, rename = "build-arguments")]
    pub build_arguments: BTreeMap<String, String>,
    /// Jail options, each a single `{option: value}` pair.
    #[serde(default)]
    pub options: Vec<BTreeMap<String, Option<String>>>,
    #[serde(default, rename = "cloud-init")]
    pub cloud_init: Option<CloudInit>,
    #[serde(default)]
    pub restart: bool,
}

impl VmRequest {
    pub fn validate(&self) -> Result<(), String> {
        match (&self.makejail, &self.makejail_from_metadata) {
            (Some(makejail), None) => non_empty("makejail", makejail)?,
            (None, Some(key)) => validate_name("metadata key", key)?,
            _ => {
                return Err(
                    "exactly one of 'makejail' and 'makejailFromMetadata' is required".to_string(),
                )
            }
        }

        if self.template.is_empty() {
            return Err("'template' must not be empty".to_string());
        }
        validate_env_names("template", self.template.keys())?;

        non_empty("diskLayout.driver", &self.disk_layout.driver)?;
        if !DISK_SIZE.is_match(&self.disk_layout.size) {
            return Err(format!(
                "invalid disk size '{}'",
                self.disk_layout.size
            ));
        }
        self.disk_layout.from.validate()?;

        for key in self.metadata.keys() {
            validate_name("metadata key", key)?;
        }
        validate_env_names("script-environment", self.script_environment.keys())?;
        validate_env_names("start-environment", self.start_environment.keys())?;
        validate_env_names("build-environment", self.build_environment.keys())?;
        validate_env_names("start-arguments", self.start_arguments.keys())?;
        validate_env_names("build-arguments", self.build_arguments.keys())?;

        for option in self.options.iter() {
            if option.len() != 1 {
                return Err("each entry of 'options' must hold exactly one option".to_string());
            }
        }

        if let Some(cloud_init) = &self.cloud_init {
            non_empty("cloud-init.user-data", &cloud_init.user_data)?;
        }

        Ok(())
    }
}

/// A VM creation job: the profile plus the resolved Makejail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmCreate {
    pub name: String,
    pub makejail: String,
    pub request: VmRequest,
}
