//! Decide which groups of a histogram may be released.

use dpagg::prelude::*;

fn main() -> dpagg::Result<()> {
    let mut selection = LaplacePartitionSelection::builder()
        .with_epsilon(1.0)
        .with_delta(1e-5)
        .with_max_partitions_contributed(1)
        .build()?;

    let groups: [(&str, i64); 4] = [("a", 3), ("b", 12), ("c", 47), ("d", 210)];
    for (name, users) in groups {
        let keep = selection.should_keep(users);
        println!("group {name} ({users} users): {}", if keep { "release" } else { "suppress" });
    }
    Ok(())
}
