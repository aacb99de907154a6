//! The installation protocol: a fixed, linear list of console phases built
//! from configuration, and the driver that runs it against a session.

use std::path::{Path, PathBuf};

use crate::config::{Config, MarkersConfig};
use crate::console::{
    ConsolePhase, ConsoleSession, ConsoleTransport, CredentialPrompts, PhaseResult, VirshConsole,
};
use crate::error::ProvisionError;
use crate::logging::{self, Transcript};
use crate::progress::StepProgress;

/// Escape byte that interrupts the boot menu countdown.
const ESCAPE: &str = "\x1b";

/// One unit of work inside a [`Stage`].
#[derive(Clone)]
pub enum InstallStep {
    Phase(ConsolePhase),
    /// Forced first-login password change.
    ChangePassword {
        prompts: CredentialPrompts,
        old: String,
        new: String,
    },
}

impl InstallStep {
    pub fn name(&self) -> &str {
        match self {
            InstallStep::Phase(phase) => &phase.name,
            InstallStep::ChangePassword { .. } => "forced-password-change",
        }
    }
}

/// A group of steps rendered as one progress line.
#[derive(Clone)]
pub struct Stage {
    pub label: String,
    pub steps: Vec<InstallStep>,
}

impl From<&MarkersConfig> for CredentialPrompts {
    fn from(markers: &MarkersConfig) -> Self {
        Self {
            password: markers.password.clone(),
            current_password: markers.current_password.clone(),
            new_password: markers.new_password.clone(),
            retype_password: markers.retype_password.clone(),
        }
    }
}

fn phases(list: Vec<ConsolePhase>) -> Vec<InstallStep> {
    list.into_iter().map(InstallStep::Phase).collect()
}

/// Build the installation sequence.
///
/// `config_file` is the declarative configuration to apply on the installed
/// machine; without it the sequence ends once the temporary network is up.
pub fn install_stages(config: &Config, config_file: Option<&str>) -> Vec<Stage> {
    let installer = &config.installer;
    let markers = &installer.markers;
    let creds = &config.credentials;
    let net = &config.temp_network;
    let boot = installer.boot_timeout();

    let mut stages = vec![Stage {
        label: "Booting installer".into(),
        steps: phases(vec![
            ConsolePhase::new("escape-to-boot-prompt", &markers.escape).send(ESCAPE),
            ConsolePhase::new("inject-boot-line", &markers.boot_prompt)
                .send(&installer.boot_line)
                .send("\r"),
            ConsolePhase::new("wait-for-kernel-load", &markers.kernel).with_timeout(boot),
            ConsolePhase::new("wait-for-initrd-load", &markers.initrd).with_timeout(boot),
            ConsolePhase::new("wait-for-installer-start", &markers.installer_start)
                .with_timeout(boot),
            ConsolePhase::new("wait-for-post-install-setup", &markers.post_install)
                .with_timeout(boot),
        ]),
    }];

    let mut login = vec![InstallStep::Phase(
        ConsolePhase::new("wait-for-login-prompt", &markers.login)
            .send(&creds.username)
            .with_timeout(boot),
    )];
    if creds.force_password_change {
        login.push(InstallStep::ChangePassword {
            prompts: markers.into(),
            old: creds.initial_password().to_string(),
            new: creds.password.clone(),
        });
    } else {
        login.push(InstallStep::Phase(
            ConsolePhase::new("authenticate", &markers.password).send_secret(&creds.password),
        ));
    }
    stages.push(Stage {
        label: "Logging in".into(),
        steps: login,
    });

    stages.push(Stage {
        label: "Configuring temporary network".into(),
        steps: phases(vec![
            ConsolePhase::new("wait-for-shell-prompt", &markers.shell_prompt).send(format!(
                "sudo ip addr add {}/{} dev {}",
                net.address, net.prefix, net.interface
            )),
            ConsolePhase::new("sudo-password", &markers.password).send_secret(&creds.password),
            ConsolePhase::new("link-up", &markers.shell_prompt)
                .send(format!("sudo ip link set {} up", net.interface)),
            ConsolePhase::new("default-route", &markers.shell_prompt)
                .send(format!("sudo ip route add default via {}", net.gateway)),
            ConsolePhase::new("loopback-probe", &markers.shell_prompt)
                .send(format!("ping -c 1 {}", net.probe_target)),
            ConsolePhase::new("probe-ack", &markers.probe_ack).network_probe(),
        ]),
    });

    if let Some(path) = config_file {
        stages.push(Stage {
            label: "Applying configuration".into(),
            steps: phases(vec![
                ConsolePhase::new("apply-declarative-configuration", &markers.shell_prompt)
                    .send(format!("{} --config-file {path}", installer.config_command)),
                ConsolePhase::new("wait-for-configuration-applied", &markers.config_applied)
                    .with_timeout(installer.config_timeout()),
            ]),
        });
    }

    stages
}

/// Outcome of a completed installation.
#[derive(Debug, Clone)]
pub struct InstallReport {
    pub phases: Vec<PhaseResult>,
    pub transcript: Option<PathBuf>,
}

async fn run_step<T: ConsoleTransport>(
    session: &mut ConsoleSession<T>,
    step: &InstallStep,
) -> Result<Vec<PhaseResult>, ProvisionError> {
    match step {
        InstallStep::Phase(phase) => Ok(vec![session.advance(phase).await?]),
        InstallStep::ChangePassword { prompts, old, new } => {
            let ack = session
                .send_credential_change_sequence(prompts, old, new)
                .await?;
            tracing::info!("password changed");
            Ok(ack.phases)
        }
    }
}

async fn run_stages<T: ConsoleTransport>(
    session: &mut ConsoleSession<T>,
    stages: &[Stage],
    progress: &mut StepProgress,
) -> Result<Vec<PhaseResult>, ProvisionError> {
    let mut completed = Vec::new();
    for stage in stages {
        let session = &mut *session;
        let results = progress
            .run(&stage.label, |step| async move {
                let mut results = Vec::new();
                for install_step in &stage.steps {
                    match run_step(session, install_step).await {
                        Ok(done) => {
                            for r in &done {
                                let secs = r.elapsed.as_secs_f64();
                                step.log(&format!("{} ({secs:.1}s)", r.phase));
                            }
                            results.extend(done);
                        }
                        Err(e) => {
                            step.fail(format!("{}: {}", stage.label, install_step.name()));
                            return Err(e);
                        }
                    }
                }
                step.set_done_label(format!("{} ({} phases)", stage.label, results.len()));
                Ok(results)
            })
            .await?;
        completed.extend(results);
    }
    Ok(completed)
}

/// Drive `session` through `stages`, then finish it.
///
/// The session is closed on every path: on failure the transport and
/// transcript are released before the error is returned.
pub async fn run_install<T: ConsoleTransport>(
    session: &mut ConsoleSession<T>,
    stages: &[Stage],
    progress: &mut StepProgress,
) -> Result<InstallReport, ProvisionError> {
    match run_stages(session, stages, progress).await {
        Ok(phases) => {
            let transcript = session.finish().await?;
            Ok(InstallReport { phases, transcript })
        }
        Err(e) => {
            if let Err(close_err) = session.close().await {
                tracing::warn!("closing console after failure: {close_err}");
            }
            Err(e)
        }
    }
}

/// Attach to `domain`'s serial console and run the installation.
pub async fn install_domain(
    config: &Config,
    domain: &str,
    config_file: Option<&str>,
    logs_dir: &Path,
    progress: &mut StepProgress,
) -> Result<InstallReport, ProvisionError> {
    let console = VirshConsole::open(&config.installer.libvirt_uri, domain)?;
    let transcript_name = format!("console-{domain}");
    let transcript =
        Transcript::create(logs_dir, &transcript_name).map_err(|e| ProvisionError::Io {
            context: format!("creating console transcript in {}", logs_dir.display()),
            source: e,
        })?;
    let mut session = ConsoleSession::new(console, transcript, config.installer.default_timeout());

    let stages = install_stages(config, config_file);
    let result = run_install(&mut session, &stages, progress).await;
    logging::rotate_transcripts(logs_dir, &transcript_name, logging::KEEP_TRANSCRIPTS);

    if let Ok(report) = &result {
        tracing::info!(domain, phases = report.phases.len(), "installation complete");
    }
    result
}
