use futures::TryStreamExt;
use log::debug;
use netlink_packet_route::rule::{RuleAction, RuleAttribute, RuleMessage};
use rtnetlink::{Handle, IpVersion};

use crate::error::{ok_if_exists, Result};

fn matches_fwmark(msg: &RuleMessage, fwmark: u32, table: u32) -> bool {
    let mark_matches = msg
        .attributes
        .iter()
        .any(|a| matches!(a, RuleAttribute::FwMark(m) if *m == fwmark));
    let table_matches = msg
        .attributes
        .iter()
        .any(|a| matches!(a, RuleAttribute::Table(t) if *t == table));
    mark_matches && table_matches
}

/// Dumps the IPv4 routing rules.
pub async fn rule_list_v4(handle: &Handle) -> Result<Vec<RuleMessage>> {
    let mut stream = handle.rule().get(IpVersion::V4).execute();
    let mut rules = Vec::new();
    while let Some(msg) = stream.try_next().await.map_err(crate::NetError::from)? {
        rules.push(msg);
    }
    Ok(rules)
}

/// True when an IPv4 rule `fwmark <mark> lookup <table>` is installed.
pub async fn fwmark_rule_exists(handle: &Handle, fwmark: u32, table: u32) -> Result<bool> {
    Ok(rule_list_v4(handle)
        .await?
        .iter()
        .any(|msg| matches_fwmark(msg, fwmark, table)))
}

/// Installs `fwmark <mark> lookup <table>`; an existing rule is success.
pub async fn rule_add_fwmark(handle: &Handle, fwmark: u32, table: u32) -> Result<()> {
    debug!("rule add fwmark {fwmark:#x} lookup table {table}");
    ok_if_exists(
        handle
            .rule()
            .add()
            .v4()
            .fw_mark(fwmark)
            .table_id(table)
            .action(RuleAction::ToTable)
            .execute()
            .await
            .map_err(crate::NetError::from),
    )
}

/// Deletes the matching fwmark rule; an absent rule is success.
pub async fn rule_del_fwmark(handle: &Handle, fwmark: u32, table: u32) -> Result<()> {
    for msg in rule_list_v4(handle).await? {
        if matches_fwmark(&msg, fwmark, table) {
            debug!("rule del fwmark {fwmark:#x} lookup table {table}");
            handle
                .rule()
                .del(msg)
                .execute()
                .await
                .map_err(crate::NetError::from)?;
            return Ok(());
        }
    }
    Ok(())
}
