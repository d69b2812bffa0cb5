//! Container tree report.

use crate::ipam::{Block, BlockStatus, Container, ContainerTree};
use crate::models::usable_hosts;
use colored::Colorize;

/// Block listing columns and their widths. The last one is unpadded.
const BLOCK_COLUMNS: [(&str, usize); 6] = [
    ("container", 32),
    ("cidr", 18),
    ("status", 10),
    ("type", 12),
    ("hosts", 8),
    ("parent", 0),
];

const TOTAL_COLUMNS: [(&str, usize); 4] = [
    ("container", 56),
    ("free", 10),
    ("aggregate", 10),
    ("deployed", 10),
];

/// Address counts of a container's own blocks.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BlockTotals {
    pub free: u64,
    pub aggregate: u64,
    pub deployed: u64,
}

fn addresses<'a>(blocks: impl Iterator<Item = &'a Block>) -> u64 {
    blocks.map(|b| b.cidr().size()).sum()
}

impl BlockTotals {
    pub fn of(container: &Container) -> Self {
        BlockTotals {
            free: addresses(container.free_blocks()),
            aggregate: addresses(container.aggregate_blocks()),
            deployed: addresses(container.deployed_blocks()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportRow {
    pub depth: usize,
    pub container: String,
    pub cidr: String,
    pub status: BlockStatus,
    pub block_type: String,
    pub hosts: u64,
    pub parent: String,
}

/// One row per block, containers in tree order, blocks by address.
pub fn report_rows(tree: &ContainerTree) -> Vec<ReportRow> {
    let mut rows = Vec::new();
    for container in tree.containers() {
        let depth = container.name.matches('/').count().saturating_sub(1);
        let mut blocks: Vec<&Block> = container.blocks.iter().collect();
        blocks.sort_by_key(|b| (b.address, b.prefix_length));
        for b in blocks {
            rows.push(ReportRow {
                depth,
                container: container.short_name().to_string(),
                cidr: b.cidr().to_string(),
                status: b.status,
                block_type: format!("{:?}", b.block_type),
                hosts: usable_hosts(b.prefix_length).unwrap_or(0),
                parent: b.parent_path.clone(),
            });
        }
    }
    rows
}

fn header(columns: &[(&str, usize)]) -> String {
    columns
        .iter()
        .map(|(title, width)| format!("{title:<width$}"))
        .collect::<Vec<_>>()
        .join(" ")
        .trim_end()
        .to_string()
}

/// Status padded to its column first, so the color codes do not shift alignment.
fn status_cell(status: BlockStatus, width: usize) -> String {
    let label = format!("{:<width$}", format!("{status:?}"));
    match status {
        BlockStatus::Free => label.green().to_string(),
        BlockStatus::Aggregate => label.yellow().to_string(),
        BlockStatus::Deployed => label.blue().to_string(),
    }
}

fn block_line(row: &ReportRow) -> String {
    let [container, cidr, status, block_type, hosts, _] = BLOCK_COLUMNS.map(|(_, w)| w);
    let indented = format!("{}{}", "  ".repeat(row.depth), row.container);
    format!(
        "{indented:<container$} {cidr_value:<cidr$} {status_value} {type_value:<block_type$} \
         {hosts_value:>hosts$} {parent}",
        cidr_value = row.cidr,
        status_value = status_cell(row.status, status),
        type_value = row.block_type,
        hosts_value = row.hosts,
        parent = row.parent,
    )
}

fn totals_line(name: &str, totals: BlockTotals) -> String {
    let [container, free, aggregate, deployed] = TOTAL_COLUMNS.map(|(_, w)| w);
    format!(
        "{name:<container$} {:>free$} {:>aggregate$} {:>deployed$}",
        totals.free, totals.aggregate, totals.deployed
    )
}

/// Print the tree as aligned block rows followed by per-container totals.
pub fn print_report(tree: &ContainerTree) {
    log::info!("#Start print_report()");
    println!("{}", header(&BLOCK_COLUMNS).bold());
    for row in report_rows(tree) {
        println!("{}", block_line(&row));
    }

    println!();
    println!("{}", header(&TOTAL_COLUMNS).bold());
    for container in tree.containers() {
        if container.blocks.is_empty() {
            continue;
        }
        println!("{}", totals_line(&container.name, BlockTotals::of(container)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipam::BlockType;

    fn sample_tree() -> ContainerTree {
        let mut tree = ContainerTree::new();
        let root = "/Global/us-east-1/IPv4/dev";
        tree.add_environment_root(root, &["10.0.0.0/22".parse().unwrap()])
            .unwrap();
        let vpc = tree.add_container(root, "123456789012-app").unwrap();
        tree.allocate_block(root, &vpc, 24, BlockType::Vpc, BlockStatus::Aggregate)
            .unwrap();
        let subnet = tree.add_container(&vpc, "public-a").unwrap();
        tree.allocate_block(&vpc, &subnet, 26, BlockType::Subnet, BlockStatus::Deployed)
            .unwrap();
        tree
    }

    #[test]
    fn test_totals_of_vpc_container() {
        let tree = sample_tree();
        let vpc = tree
            .get("/Global/us-east-1/IPv4/dev/123456789012-app")
            .unwrap();
        let totals = BlockTotals::of(vpc);
        assert_eq!(totals.aggregate, 256);
        assert_eq!(totals.free, 192);
        assert_eq!(totals.deployed, 0);

        let subnet = tree
            .get("/Global/us-east-1/IPv4/dev/123456789012-app/public-a")
            .unwrap();
        assert_eq!(BlockTotals::of(subnet).deployed, 64);
    }

    #[test]
    fn test_report_rows_in_tree_order() {
        let rows = report_rows(&sample_tree());
        let first_subnet_row = rows
            .iter()
            .position(|r| r.container == "public-a")
            .unwrap();
        let first_vpc_row = rows
            .iter()
            .position(|r| r.container == "123456789012-app")
            .unwrap();
        assert!(first_vpc_row < first_subnet_row);
        let deployed = &rows[first_subnet_row];
        assert_eq!(deployed.cidr, "10.0.0.0/26");
        assert_eq!(deployed.status, BlockStatus::Deployed);
        assert_eq!(deployed.depth, 5);
    }

    #[test]
    fn test_lines_keep_columns_aligned() {
        colored::control::set_override(false);
        let rows = report_rows(&sample_tree());
        let deployed = rows.iter().find(|r| r.container == "public-a").unwrap();
        let line = block_line(deployed);
        assert!(line.starts_with("          public-a"));
        let cidr_at = BLOCK_COLUMNS[0].1 + 1;
        assert_eq!(&line[cidr_at..cidr_at + 11], "10.0.0.0/26");
        let status_at = cidr_at + BLOCK_COLUMNS[1].1 + 1;
        assert_eq!(&line[status_at..status_at + 10], "Deployed  ");
        assert!(line.ends_with("      59 /Global/us-east-1/IPv4/dev/123456789012-app"));

        let totals = BlockTotals { free: 192, aggregate: 256, deployed: 0 };
        let line = totals_line("/x", totals);
        assert_eq!(line.len(), 56 + 3 * 11);
        assert!(line.ends_with("       192        256          0"));
        assert_eq!(header(&TOTAL_COLUMNS).split_whitespace().count(), 4);
    }
}
