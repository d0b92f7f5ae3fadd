//! End-to-end CLI tests against a scripted stand-in for `vmrun`.
//!
//! The fake tool keeps the set of running images in a state file next to
//! itself, so `start`/`stop`/`status` observe each other across invocations.

#![cfg(unix)]

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

const FAKE_VMRUN: &str = r#"#!/bin/sh
DIR="$(dirname "$0")"
STATE="$DIR/running"
echo "$*" >> "$DIR/calls"
case "$1" in
  list)
    if [ -f "$STATE" ]; then
      echo "Total running VMs: $(wc -l < "$STATE" | tr -d ' ')"
      cat "$STATE"
    else
      echo "Total running VMs: 0"
    fi
    ;;
  listSnapshots)
    echo "Total snapshots: 2"
    echo "clean"
    echo "office-installed"
    ;;
  revertToSnapshot)
    if [ "$3" = "broken" ]; then
      echo "Error: The snapshot could not be restored"
      exit 255
    fi
    ;;
  start)
    echo "$2" >> "$STATE"
    ;;
  stop)
    grep -v -x -F "$2" "$STATE" > "$STATE.tmp" || true
    mv "$STATE.tmp" "$STATE"
    ;;
  *)
    echo "Error: unknown command $1"
    exit 255
    ;;
esac
"#;

struct Lab {
    dir: TempDir,
}

impl Lab {
    fn new() -> Self {
        let dir = TempDir::new().expect("tempdir");
        let vmrun = dir.path().join("vmrun");
        fs::write(&vmrun, FAKE_VMRUN).unwrap();
        fs::set_permissions(&vmrun, fs::Permissions::from_mode(0o755)).unwrap();
        for name in ["win7", "xp"] {
            fs::write(dir.path().join(format!("{name}.vmx")), "config.version = \"8\"\n").unwrap();
        }
        let lab = Lab { dir };
        lab.write_config(&[("win7", "clean"), ("xp", "office-installed")]);
        lab
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    fn image(&self, name: &str) -> String {
        self.path(&format!("{name}.vmx")).display().to_string()
    }

    fn write_config(&self, machines: &[(&str, &str)]) {
        let mut doc = format!(
            "[vmware]\npath = {:?}\nmode = \"gui\"\nsettle_ms = 0\ntimeout_secs = 10\n\n\
             [resultserver]\nip = \"10.0.0.1\"\nport = 2042\n",
            self.path("vmrun").display().to_string()
        );
        for (i, (name, snapshot)) in machines.iter().enumerate() {
            doc.push_str(&format!(
                "\n[[machines]]\nname = \"{name}\"\nlabel = \"{},{snapshot}\"\nip = \"10.0.0.{}\"\n",
                self.image(name),
                i + 5
            ));
        }
        fs::write(self.path("labvm.toml"), doc).unwrap();
    }

    fn labvm(&self) -> Command {
        let mut cmd = Command::cargo_bin("labvm").expect("labvm binary should exist");
        cmd.arg("--config")
            .arg(self.path("labvm.toml"))
            .env("LABVM_LOG", "error")
            .env_remove("RUST_LOG");
        cmd
    }

    fn calls(&self) -> Vec<String> {
        fs::read_to_string(self.path("calls"))
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }

    fn clear_calls(&self) {
        let _ = fs::remove_file(self.path("calls"));
    }

    fn json(&self, args: &[&str]) -> serde_json::Value {
        let output = self.labvm().args(args).output().unwrap();
        assert!(
            output.status.success(),
            "labvm {args:?} failed: {}",
            String::from_utf8_lossy(&output.stderr)
        );
        serde_json::from_slice(&output.stdout).expect("stdout is JSON")
    }
}

fn subcommands(calls: &[String]) -> Vec<&str> {
    calls
        .iter()
        .filter_map(|c| c.split_whitespace().next())
        .collect()
}

#[test]
fn check_verifies_every_machine() {
    let lab = Lab::new();
    let value = lab.json(&["check"]);
    assert_eq!(value["status"], "ok");
    assert_eq!(value["command"], "check");
    assert_eq!(value["machines"].as_array().unwrap().len(), 2);
    assert_eq!(value["config"]["identity"].as_str().unwrap().len(), 64);
    assert_eq!(subcommands(&lab.calls()), vec!["listSnapshots", "listSnapshots"]);
}

#[test]
fn check_reports_missing_snapshot_with_label() {
    let lab = Lab::new();
    lab.write_config(&[("win7", "clean"), ("xp", "nightly")]);
    let label = format!("{},nightly", lab.image("xp"));

    lab.labvm()
        .arg("check")
        .assert()
        .code(11)
        .stderr(predicate::str::contains(label))
        .stderr(predicate::str::contains("ERR_CONFIG"));
}

#[test]
fn check_missing_image_stops_in_declared_order() {
    let lab = Lab::new();
    fs::remove_file(lab.path("win7.vmx")).unwrap();

    lab.labvm()
        .args(["--format", "human", "check"])
        .assert()
        .code(11)
        .stderr(predicate::str::contains("win7.vmx,clean"));
    assert!(lab.calls().is_empty());
}

#[test]
fn list_does_not_touch_the_tool() {
    let lab = Lab::new();
    lab.labvm()
        .args(["-f", "human", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("win7"))
        .stdout(predicate::str::contains("10.0.0.6"));
    assert!(lab.calls().is_empty());
}

#[test]
fn start_status_stop_cycle() {
    let lab = Lab::new();

    lab.labvm().args(["status", "win7"]).assert().code(1);

    let started = lab.json(&["start", "win7"]);
    assert_eq!(started["machine"]["name"], "win7");
    assert_eq!(started["mode"], "gui");

    let status = lab.json(&["status", "win7"]);
    assert_eq!(status["machines"][0]["state"], "running");

    let all = lab.json(&["status"]);
    let states: Vec<_> = all["machines"]
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["state"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(states, vec!["running", "stopped"]);

    let stopped = lab.json(&["stop", "win7"]);
    assert_eq!(stopped["outcome"], "powered_off");
    lab.labvm().args(["status", "win7"]).assert().code(1);
}

#[test]
fn start_twice_is_refused_without_revert() {
    let lab = Lab::new();
    lab.json(&["start", "win7"]);
    lab.clear_calls();

    lab.labvm()
        .args(["start", "win7"])
        .assert()
        .code(30)
        .stderr(predicate::str::contains("already running"));

    let calls = lab.calls();
    let subs = subcommands(&calls);
    assert!(!subs.contains(&"revertToSnapshot"));
    assert!(!subs.contains(&"start"));
}

#[test]
fn stop_when_stopped_is_a_noop() {
    let lab = Lab::new();
    lab.json(&["check"]);
    lab.clear_calls();

    let value = lab.json(&["stop", "xp"]);
    assert_eq!(value["outcome"], "already_stopped");
    // Startup checks plus one status query, no stop.
    assert_eq!(
        subcommands(&lab.calls()),
        vec!["listSnapshots", "listSnapshots", "list"]
    );
}

#[test]
fn revert_failure_names_invocation() {
    let lab = Lab::new();
    fs::write(
        lab.path("vmrun"),
        FAKE_VMRUN.replace("echo \"clean\"", "echo \"broken\""),
    )
    .unwrap();
    lab.write_config(&[("win7", "broken")]);

    lab.labvm()
        .args(["start", "win7"])
        .assert()
        .code(30)
        .stderr(predicate::str::contains("vmrun revertToSnapshot"))
        .stderr(predicate::str::contains("could not be restored"));

    assert!(!subcommands(&lab.calls()).contains(&"start"));
}

#[test]
fn unknown_machine_is_a_config_error() {
    let lab = Lab::new();
    lab.labvm()
        .args(["status", "nope"])
        .assert()
        .code(11)
        .stderr(predicate::str::contains("win7, xp"));
}

#[test]
fn filter_prints_scoped_expression() {
    let lab = Lab::new();
    lab.labvm()
        .args(["-f", "human", "filter", "win7"])
        .assert()
        .success()
        .stdout(predicate::eq(
            "host 10.0.0.5 and not (host 10.0.0.5 and port 8000) and not (host 10.0.0.1 and port 2042)\n",
        ));

    let value = lab.json(&["filter", "xp"]);
    assert_eq!(value["args"][0], "host");
    assert_eq!(value["args"][1], "10.0.0.6");
    assert_eq!(value["clauses"].as_array().unwrap().len(), 3);
}

#[test]
fn run_without_capture_brackets_machine() {
    let lab = Lab::new();
    let value = lab.json(&["run", "xp", "--duration", "0"]);
    assert_eq!(value["power_off"], "powered_off");
    assert!(value["capture"].is_null());
    assert_eq!(
        subcommands(&lab.calls()),
        vec!["listSnapshots", "listSnapshots", "list", "revertToSnapshot", "start", "list", "stop"]
    );
    assert!(!fs::read_to_string(lab.path("running"))
        .unwrap_or_default()
        .contains(&lab.image("xp")));
}

#[test]
fn run_with_dump_uses_fake_tcpdump() {
    let lab = Lab::new();
    let tcpdump = lab.path("tcpdump");
    fs::write(
        &tcpdump,
        format!(
            "#!/bin/sh\necho \"$@\" > {}\nexec sleep 30\n",
            lab.path("tcpdump.args").display()
        ),
    )
    .unwrap();
    fs::set_permissions(&tcpdump, fs::Permissions::from_mode(0o755)).unwrap();

    let mut config = fs::read_to_string(lab.path("labvm.toml")).unwrap();
    config.push_str(&format!(
        "\n[sniffer]\nenabled = true\ntcpdump = {:?}\ninterface = \"vboxnet0\"\nrequire_privileged = false\n",
        tcpdump.display().to_string()
    ));
    fs::write(lab.path("labvm.toml"), config).unwrap();

    let dump = lab.path("out").join("win7.pcap");
    let value = lab.json(&["run", "win7", "--duration", "1", "--dump", dump.to_str().unwrap()]);

    assert_eq!(value["capture"]["stop"], "terminated");
    assert_eq!(value["power_off"], "powered_off");
    assert!(lab.path("out").is_dir());

    let args = fs::read_to_string(lab.path("tcpdump.args")).unwrap();
    assert!(args.starts_with("-U -q -i vboxnet0 -n -w "));
    assert!(args.contains("host 10.0.0.5 and not ( host 10.0.0.5 and port 8000 )"));
}

#[test]
fn run_without_dump_writes_into_dump_dir() {
    let lab = Lab::new();
    let tcpdump = lab.path("tcpdump");
    fs::write(
        &tcpdump,
        format!(
            "#!/bin/sh\necho \"$@\" > {}\nexec sleep 30\n",
            lab.path("tcpdump.args").display()
        ),
    )
    .unwrap();
    fs::set_permissions(&tcpdump, fs::Permissions::from_mode(0o755)).unwrap();

    let dump_dir = lab.path("captures");
    let mut config = fs::read_to_string(lab.path("labvm.toml")).unwrap();
    config.push_str(&format!(
        "\n[sniffer]\nenabled = true\ntcpdump = {:?}\ninterface = \"vboxnet0\"\nrequire_privileged = false\ndump_dir = {:?}\n",
        tcpdump.display().to_string(),
        dump_dir.display().to_string()
    ));
    fs::write(lab.path("labvm.toml"), config).unwrap();

    let value = lab.json(&["run", "xp", "--duration", "0"]);
    let output_path = value["capture"]["output_path"].as_str().unwrap().to_string();
    assert!(output_path.starts_with(&dump_dir.display().to_string()));
    assert!(output_path.ends_with(".pcap"));
    assert!(Path::new(&output_path)
        .file_name()
        .unwrap()
        .to_string_lossy()
        .starts_with("xp-run-"));
    assert!(dump_dir.is_dir());

    let args = fs::read_to_string(lab.path("tcpdump.args")).unwrap();
    assert!(args.contains(&format!("-w {output_path} ")));
}

#[test]
fn capture_that_dies_at_startup_leaves_machine_alone() {
    let lab = Lab::new();
    let tcpdump = lab.path("tcpdump");
    fs::write(
        &tcpdump,
        "#!/bin/sh\necho 'tcpdump: vboxnet9: No such device exists' >&2\nexit 1\n",
    )
    .unwrap();
    fs::set_permissions(&tcpdump, fs::Permissions::from_mode(0o755)).unwrap();

    let mut config = fs::read_to_string(lab.path("labvm.toml")).unwrap();
    config.push_str(&format!(
        "\n[sniffer]\nenabled = true\ntcpdump = {:?}\ninterface = \"vboxnet9\"\nrequire_privileged = false\n",
        tcpdump.display().to_string()
    ));
    fs::write(lab.path("labvm.toml"), config).unwrap();

    let dump = lab.path("out").join("xp.pcap");
    lab.labvm()
        .args(["run", "xp", "--dump", dump.to_str().unwrap()])
        .assert()
        .code(31)
        .stderr(predicate::str::contains("No such device exists"));

    let calls = lab.calls();
    let subs = subcommands(&calls);
    assert!(!subs.contains(&"revertToSnapshot"));
    assert!(!subs.contains(&"start"));
}

#[test]
fn missing_config_exits_with_config_error() {
    let dir = TempDir::new().unwrap();
    let missing: &Path = &dir.path().join("absent.toml");
    Command::cargo_bin("labvm")
        .unwrap()
        .arg("--config")
        .arg(missing)
        .arg("list")
        .env("LABVM_LOG", "error")
        .assert()
        .code(11)
        .stderr(predicate::str::contains("absent.toml"));
}
