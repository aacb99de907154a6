//! Provisioning driver: turns a validated plan into libvirt domains.
//!
//! Work is first laid out as a list of [`Action`]s, then executed one by one
//! through `virsh` and `qemu-img`. Nothing here runs before the capacity
//! gate has passed.

use std::fmt;
use std::path::{Path, PathBuf};

use crate::config::Config;
use crate::domain_xml::{DomainLayout, generate_domain_xml};
use crate::error::ProvisionError;
use crate::paths;
use crate::plan::{NodeSpec, ProvisioningPlan};
use crate::progress::StepProgress;

/// External programs used for provisioning.
#[derive(Debug, Clone)]
pub struct Tools {
    pub virsh: String,
    pub qemu_img: String,
    pub libvirt_uri: String,
}

impl Tools {
    pub fn new(libvirt_uri: &str) -> Self {
        Self {
            virsh: "virsh".into(),
            qemu_img: "qemu-img".into(),
            libvirt_uri: libvirt_uri.into(),
        }
    }
}

/// One side effect on the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Stop (best effort) and undefine a domain if it exists.
    RemoveDomain { name: String },
    RemoveFile { path: PathBuf },
    CreateImage { path: PathBuf, size_gb: u64 },
    WriteXml { path: PathBuf, xml: String },
    Define { path: PathBuf },
    Start { name: String },
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::RemoveDomain { name } => write!(f, "remove domain {name}"),
            Action::RemoveFile { path } => write!(f, "delete {}", path.display()),
            Action::CreateImage { path, size_gb } => {
                write!(f, "create {} ({size_gb}G)", path.display())
            }
            Action::WriteXml { path, .. } => write!(f, "write {}", path.display()),
            Action::Define { path } => write!(f, "define {}", path.display()),
            Action::Start { name } => write!(f, "start {name}"),
        }
    }
}

/// Actions that (re)create one node, without starting it.
pub fn node_actions(
    config: &Config,
    node: &NodeSpec,
    iso: Option<&Path>,
    xml_path: PathBuf,
) -> Vec<Action> {
    let images_dir = Path::new(&config.libvirt.images_dir);
    let disks = paths::disk_image_paths(images_dir, &node.id);
    let sizes = [node.partition_a_gb, node.partition_b_gb];

    let mut actions = vec![Action::RemoveDomain {
        name: node.id.clone(),
    }];
    for (path, size_gb) in disks.iter().zip(sizes) {
        actions.push(Action::RemoveFile { path: path.clone() });
        actions.push(Action::CreateImage {
            path: path.clone(),
            size_gb,
        });
    }

    let xml = generate_domain_xml(&DomainLayout { node, disks, iso }, &config.libvirt);
    actions.push(Action::WriteXml {
        path: xml_path.clone(),
        xml,
    });
    actions.push(Action::Define { path: xml_path });
    actions
}

/// Actions that remove one node and its images.
pub fn teardown_actions(config: &Config, node: &NodeSpec, xml_path: PathBuf) -> Vec<Action> {
    let images_dir = Path::new(&config.libvirt.images_dir);
    let mut actions = vec![Action::RemoveDomain {
        name: node.id.clone(),
    }];
    actions.extend(
        paths::disk_image_paths(images_dir, &node.id)
            .into_iter()
            .map(|path| Action::RemoveFile { path }),
    );
    actions.push(Action::RemoveFile { path: xml_path });
    actions
}

/// Run `program <prefix..> <args..>`; errors name the program and `args[0]`.
async fn run(program: &str, prefix: &[&str], args: &[&str]) -> Result<String, ProvisionError> {
    let output = tokio::process::Command::new(program)
        .args(prefix)
        .args(args)
        .output()
        .await
        .map_err(|e| ProvisionError::Io {
            context: format!("running {program}"),
            source: e,
        })?;

    if !output.status.success() {
        let subcommand = args.first().copied().unwrap_or("");
        return Err(ProvisionError::ExternalCommand {
            command: format!("{program} {subcommand}").trim_end().to_string(),
            message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

impl Tools {
    async fn virsh(&self, args: &[&str]) -> Result<String, ProvisionError> {
        run(&self.virsh, &["-c", self.libvirt_uri.as_str()], args).await
    }

    /// Returns whether a domain was removed.
    async fn remove_domain(&self, name: &str) -> Result<bool, ProvisionError> {
        if self.virsh(&["domstate", name]).await.is_err() {
            return Ok(false);
        }
        if let Err(e) = self.virsh(&["destroy", name]).await {
            tracing::debug!(domain = name, "destroy: {e}");
        }
        self.virsh(&["undefine", name]).await?;
        tracing::info!(domain = name, "removed existing domain");
        Ok(true)
    }

    /// Execute one action. Returns whether a domain was removed.
    pub async fn apply(&self, action: &Action) -> Result<bool, ProvisionError> {
        tracing::debug!(%action, "applying");
        match action {
            Action::RemoveDomain { name } => return self.remove_domain(name).await,
            Action::RemoveFile { path } => match tokio::fs::remove_file(path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(ProvisionError::Io {
                        context: format!("removing {}", path.display()),
                        source: e,
                    });
                }
            },
            Action::CreateImage { path, size_gb } => {
                if let Some(parent) = path.parent() {
                    tokio::fs::create_dir_all(parent)
                        .await
                        .map_err(|e| ProvisionError::Io {
                            context: format!("creating directory {}", parent.display()),
                            source: e,
                        })?;
                }
                let path = path.to_string_lossy().into_owned();
                let size = format!("{size_gb}G");
                let args = ["create", "-f", "qcow2", path.as_str(), size.as_str()];
                run(&self.qemu_img, &[], &args).await?;
                tracing::info!(%path, size_gb, "created partition image");
            }
            Action::WriteXml { path, xml } => {
                if let Some(parent) = path.parent() {
                    tokio::fs::create_dir_all(parent)
                        .await
                        .map_err(|e| ProvisionError::Io {
                            context: format!("creating directory {}", parent.display()),
                            source: e,
                        })?;
                }
                tokio::fs::write(path, xml)
                    .await
                    .map_err(|e| ProvisionError::Io {
                        context: format!("writing {}", path.display()),
                        source: e,
                    })?;
            }
            Action::Define { path } => {
                let path = path.to_string_lossy().into_owned();
                self.virsh(&["define", path.as_str()]).await?;
            }
            Action::Start { name } => {
                self.virsh(&["start", name.as_str()]).await?;
                tracing::info!(domain = %name, "domain started");
            }
        }
        Ok(false)
    }
}

/// (Re)create every node of `plan` and start the install controller.
///
/// `iso` is attached to the install controller only.
pub async fn provision_plan(
    tools: &Tools,
    config: &Config,
    plan: &ProvisioningPlan,
    iso: &Path,
    progress: &mut StepProgress,
) -> Result<(), ProvisionError> {
    for node in plan.nodes() {
        let node_iso = plan.is_install_controller(node).then_some(iso);
        let actions = node_actions(config, node, node_iso, paths::domain_xml_path(&node.id));
        progress
            .run(&format!("Defining {}", node.id), |step| async move {
                for action in &actions {
                    step.log(&action.to_string());
                    if tools.apply(action).await? {
                        step.set_done_label(format!("Redefined {}", node.id));
                    }
                }
                Ok::<_, ProvisionError>(())
            })
            .await?;
    }

    if let Some(controller) = plan.install_controller() {
        let start = Action::Start {
            name: controller.id.clone(),
        };
        progress
            .run(&format!("Starting {}", controller.id), |_| tools.apply(&start))
            .await?;
    }
    Ok(())
}

/// Remove every domain and disk image of `plan`. Returns how many domains
/// existed.
pub async fn destroy_plan(
    tools: &Tools,
    config: &Config,
    plan: &ProvisioningPlan,
) -> Result<usize, ProvisionError> {
    let mut removed = 0;
    for node in plan.nodes() {
        for action in teardown_actions(config, node, paths::domain_xml_path(&node.id)) {
            if tools.apply(&action).await? {
                removed += 1;
            }
        }
    }
    Ok(removed)
}
