use chrono::Utc;
use color_eyre::Result;
use folio_keys::KeyRing;

use crate::{cli::KeysCommand, config, sessions};

/// Execute a keys subcommand against the configured key directory.
pub fn handle(cmd: KeysCommand, config: &config::Config) -> Result<()> {
    let ring = sessions::ring_from_config(config)?;

    match cmd {
        KeysCommand::List => {}
        KeysCommand::Rotate { force } => {
            if rotate(&ring, force)? {
                println!("Generated a new key.");
            } else {
                println!("Newest key is still fresh; use --force to rotate anyway.");
            }
        }
    }

    for line in describe(&ring)? {
        println!("{line}");
    }
    Ok(())
}

/// Rotate when due (or always with `force`). Returns whether a key was added.
fn rotate(ring: &KeyRing, force: bool) -> Result<bool> {
    if force {
        ring.rotate()?;
        return Ok(true);
    }
    Ok(ring.rotate_if_needed()?)
}

fn describe(ring: &KeyRing) -> Result<Vec<String>> {
    let now = Utc::now();
    let lines = ring
        .summaries()?
        .into_iter()
        .enumerate()
        .map(|(index, key)| {
            let marker = if index == 0 { "*" } else { " " };
            let age = now.signed_duration_since(key.created_at);
            format!(
                "{marker} {} created {} ({}d old)",
                key.id,
                key.created_at.to_rfc3339(),
                age.num_days()
            )
        })
        .collect();
    Ok(lines)
}

#[cfg(test)]
mod tests {
    use chrono::TimeDelta;

    use super::*;

    #[test]
    fn rotate_respects_freshness_unless_forced() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = sessions::test_config(dir.path());
        let ring = sessions::ring_from_config(&config).expect("ring");

        assert!(!rotate(&ring, false).expect("rotate"));
        assert!(rotate(&ring, true).expect("rotate"));
        assert_eq!(ring.len(), 2);
    }

    #[test]
    fn stale_key_is_rotated_by_the_command_not_on_open() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = sessions::test_config(dir.path());
        let key_dir = &config.session.key_ring.key_dir;
        std::fs::create_dir_all(key_dir).expect("mkdir");
        let created_at = (Utc::now() - TimeDelta::days(40)).to_rfc3339();
        let record = format!(
            r#"{{"version":1,"id":"6f1c2a9e-0d55-4a47-9d61-3c8f1e2b7a10","created_at":"{created_at}","key":"{}="}}"#,
            "A".repeat(43)
        );
        std::fs::write(key_dir.join("key-stale.json"), record).expect("write");

        let ring = sessions::ring_from_config(&config).expect("ring");
        assert_eq!(ring.len(), 1);
        assert!(rotate(&ring, false).expect("rotate"));
        assert_eq!(ring.len(), 2);
    }

    #[test]
    fn describe_marks_active_key_first() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = sessions::test_config(dir.path());
        let ring = sessions::ring_from_config(&config).expect("ring");
        rotate(&ring, true).expect("rotate");

        let lines = describe(&ring).expect("describe");
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with('*'));
        assert!(lines[1].starts_with(' '));
    }
}
