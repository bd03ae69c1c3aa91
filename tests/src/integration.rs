use assert_cmd::Command;
use predicates::prelude::predicate;

#[test]
fn test_first_sample() {
    let mut cmd = Command::cargo_bin("pyroprof-tests").unwrap();

    cmd.arg("first-sample");
    cmd.assert()
        .success()
        .stdout(predicate::str::contains(r#""outcome":"TraceMgmt_NewPid""#))
        .stdout(predicate::str::contains(r#""profile_type":1"#))
        .stdout(predicate::str::contains(r#""counts":0"#))
        .stdout(predicate::str::contains(r#""events":[{"op":1,"pid":4242}]"#));
}

#[test]
fn test_frame_pointers() {
    let mut cmd = Command::cargo_bin("pyroprof-tests").unwrap();

    cmd.arg("frame-pointers");
    cmd.assert()
        .success()
        .stdout(predicate::str::contains(r#""pid":77"#))
        .stdout(predicate::str::contains(r#""kern_stack":-1"#))
        .stdout(predicate::str::contains(r#""count":3"#))
        .stdout(predicate::str::contains(r#""user_frames":[4096,8192]"#))
        .stdout(predicate::str::contains(r#"["Sample_Counted",2]"#));
}

#[test]
fn test_lifecycle() {
    let mut cmd = Command::cargo_bin("pyroprof-tests").unwrap();

    cmd.arg("lifecycle");
    cmd.assert()
        .success()
        .stdout(predicate::str::contains(
            r#""outcomes":["TraceMgmt_NewPid","Sample_NewKey","Lifecycle_Exec","Lifecycle_PidDead"]"#,
        ))
        .stdout(predicate::str::contains(r#""pids_before":1"#))
        .stdout(predicate::str::contains(r#""removed":1"#))
        .stdout(predicate::str::contains(r#""pids_after":0"#));
}

#[test]
fn test_unknown_scenario() {
    let mut cmd = Command::cargo_bin("pyroprof-tests").unwrap();

    cmd.arg("nope");
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("unknown scenario nope"));
}
