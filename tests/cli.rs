use assert_cmd::Command;

fn bot_bin() -> Command {
    #[allow(deprecated)]
    {
        Command::cargo_bin("cc-discord-bot").expect("cc-discord-bot test binary should build")
    }
}

#[test]
fn help_exits_zero() {
    bot_bin()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicates::str::contains("daemon"))
        .stdout(predicates::str::contains("send"))
        .stdout(predicates::str::contains("schedule"));
}

#[test]
fn version_exits_zero() {
    bot_bin()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicates::str::contains("cc-discord-bot"));
}

#[test]
fn unknown_subcommand_exits_one() {
    bot_bin().arg("frobnicate").assert().code(1);
}

#[test]
fn schedule_requires_a_name() {
    bot_bin().arg("schedule").assert().code(1);
}

#[test]
fn send_with_nothing_to_send_fails() {
    // Valid parse, but no message and no files: input error, exit 1.
    bot_bin()
        .args(["send", "123456789012345678"])
        .assert()
        .code(1)
        .stderr(predicates::str::contains("nothing to send"));
}

#[test]
fn unknown_schedule_name_fails() {
    let dir = tempfile::tempdir().unwrap();
    bot_bin()
        .current_dir(dir.path())
        .args(["schedule", "no-such-schedule"])
        .assert()
        .code(1)
        .stderr(predicates::str::contains("no schedule named"));
}
