//! `forge install`: run the installer steps on the Satellite host.

use crate::Context;
use crate::cli::InstallArgs;
use crate::config::{ServerConfig, StepConfig};
use crate::ui;
use anyhow::{Context as _, Result, bail};
use std::io;
use supervisor::{StepPolicy, Supervisor};

pub fn run(ctx: &Context, args: &InstallArgs) -> Result<()> {
    let config = ctx.load_config()?;
    let (name, server) = config.server(ctx.server.as_deref())?;

    let local = local_hostname()?;
    if local != server.hostname() {
        bail!(
            "Install has to run on the Satellite server itself. Local system: {local}, server {name}: {}",
            server.hostname()
        );
    }

    let steps = if config.install.steps.is_empty() {
        default_steps(server)
    } else {
        config.install.steps.clone()
    };

    let known: Vec<&str> = steps.iter().map(|s| s.name.as_str()).collect();
    let policy = StepPolicy::new(args.skip.iter().cloned(), args.only.iter().cloned());
    for unknown in policy.unknown_steps(&known) {
        ui::warn(&format!("Unknown step '{unknown}', known steps: {}", known.join(", ")));
    }
    if !args.skip.is_empty() {
        log::warn!("Skipping these steps: {}", args.skip.join(", "));
    }
    if !args.only.is_empty() {
        log::warn!("Only these steps: {}", args.only.join(", "));
    }

    let mut supervisor = Supervisor::new(policy).with_path_marker(&config.install.path_marker);
    for step in &steps {
        let finished = supervisor
            .run_step(&step.command, &step.name, step.prompt.as_deref())
            .map_err(|err| {
                let hint = if err.is_startup() { ", is it installed?" } else { "" };
                let context = format!("Step {} could not run{hint}", step.name);
                anyhow::Error::new(err).context(context)
            })?;
        match finished {
            Some(run) if !ctx.quiet => {
                let secs = run.duration().map_or(0, |d| d.num_seconds());
                ui::success(&format!("{} ({secs}s)", step.name));
            }
            Some(_) => {}
            None => log::debug!("Step {} skipped", step.name),
        }
    }

    ui::success("Satellite installation process completed");
    Ok(())
}

/// Steps used when the configuration declares none.
pub fn default_steps(server: &ServerConfig) -> Vec<StepConfig> {
    let step = |name: &str, command: Vec<String>| StepConfig {
        name: name.to_string(),
        command,
        prompt: None,
    };
    let argv = |parts: &[&str]| parts.iter().map(ToString::to_string).collect::<Vec<_>>();

    let mut installer = argv(&[
        "satellite-installer",
        "--scenario",
        "satellite",
        "-v",
        "--foreman-logging-level",
        "debug",
        "--foreman-initial-admin-username",
        &server.username,
        "--foreman-initial-admin-password",
        &server.password,
    ]);
    if let Some(org) = &server.default_org {
        installer.extend(argv(&["--foreman-initial-organization", org]));
    }
    if let Some(location) = &server.default_location {
        installer.extend(argv(&["--foreman-initial-location", location]));
    }

    let mut steps = vec![
        step("pkg-install", argv(&["yum", "-y", "install", "satellite"])),
        step("satellite-install", installer),
    ];
    if let Some(org) = &server.default_org {
        steps.push(step(
            "set-default-org",
            argv(&["hammer", "defaults", "add", "--param-name", "organization", "--param-value", org]),
        ));
    }
    if let Some(location) = &server.default_location {
        steps.push(step(
            "set-default-loc",
            argv(&["hammer", "defaults", "add", "--param-name", "location", "--param-value", location]),
        ));
    }
    steps
}

/// Host name of the local system.
fn local_hostname() -> Result<String> {
    let mut buf = [0u8; 256];

    // SAFETY: buf is valid for buf.len() bytes and outlives the call.
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr().cast(), buf.len()) };
    if rc != 0 {
        return Err(io::Error::last_os_error()).context("Could not read the local hostname");
    }

    let end = buf.iter().position(|b| *b == 0).unwrap_or(buf.len());
    Ok(String::from_utf8_lossy(&buf[..end]).into_owned())
}
