//! `debussy audit <bead>` — completeness report for an acceptance bead.

use crate::audit::audit_acceptance;
use crate::beads::BeadClient;
use crate::events::EventLog;

pub fn run(bead_id: &str) -> anyhow::Result<()> {
    let client = BeadClient::new();
    let log = EventLog::new();
    let (ok, report) = audit_acceptance(&client, &log, bead_id);
    println!("{report}");
    if ok {
        println!("✓ pipeline complete for all dependencies of {bead_id}");
        Ok(())
    } else {
        anyhow::bail!("pipeline incomplete for {bead_id}")
    }
}
