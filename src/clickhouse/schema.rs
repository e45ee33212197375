//! DDL surgery: engine family predicates and the create-statement rewrites
//! restore needs (ATTACH/CREATE conversion, replication stripping, replica
//! renames, UUID injection, canonical comparison).

use std::{collections::BTreeMap, sync::OnceLock};

use regex::Regex;

use crate::{
	error::{Error, Result},
	util::quote_ident,
};

pub fn is_merge_tree(engine: &str) -> bool {
	engine.contains("MergeTree")
}

pub fn is_replicated(engine: &str) -> bool {
	engine.starts_with("Replicated")
}

pub fn is_distributed(engine: &str) -> bool {
	engine == "Distributed"
}

pub fn is_view(engine: &str) -> bool {
	matches!(engine, "View" | "LiveView" | "MaterializedView")
}

pub fn is_materialized_view(engine: &str) -> bool {
	engine == "MaterializedView"
}

pub fn is_dictionary(engine: &str) -> bool {
	engine == "Dictionary"
}

fn head_re() -> &'static Regex {
	static RE: OnceLock<Regex> = OnceLock::new();
	RE.get_or_init(|| {
		// UNWRAP: static pattern
		Regex::new(
			r"(?is)^\s*(?P<verb>ATTACH|CREATE)(?P<orr>\s+OR\s+REPLACE)?\s+(?P<kind>MATERIALIZED\s+VIEW|LIVE\s+VIEW|VIEW|DICTIONARY|TABLE)\s+(?P<ifne>IF\s+NOT\s+EXISTS\s+)?(?P<name>`[^`]+`\.`[^`]+`|`[^`]+`|[\w.]+)",
		)
		.unwrap()
	})
}

fn uuid_clause_re() -> &'static Regex {
	static RE: OnceLock<Regex> = OnceLock::new();
	// UNWRAP: static pattern
	RE.get_or_init(|| Regex::new(r"(?i)\s+UUID\s+'[^']+'").unwrap())
}

fn inner_uuid_clause_re() -> &'static Regex {
	static RE: OnceLock<Regex> = OnceLock::new();
	// UNWRAP: static pattern
	RE.get_or_init(|| Regex::new(r"(?i)\s+TO\s+INNER\s+UUID\s+'[^']+'").unwrap())
}

fn replicated_engine_re() -> &'static Regex {
	static RE: OnceLock<Regex> = OnceLock::new();
	RE.get_or_init(|| {
		// UNWRAP: static pattern
		Regex::new(
			r"Replicated(?P<engine>[A-Za-z]*MergeTree)\s*\(\s*'[^']*'\s*,\s*'[^']*'\s*,?\s*",
		)
		.unwrap()
	})
}

fn replica_arg_re() -> &'static Regex {
	static RE: OnceLock<Regex> = OnceLock::new();
	RE.get_or_init(|| {
		// UNWRAP: static pattern
		Regex::new(r"(?P<prefix>Replicated[A-Za-z]*MergeTree\s*\(\s*'[^']*'\s*,\s*)'(?P<replica>[^']*)'")
			.unwrap()
	})
}

/// Whether a create statement defines a replicated MergeTree engine.
pub fn is_replicated_statement(sql: &str) -> bool {
	replica_arg_re().is_match(sql)
}

/// Rewrite the statement head to address the table as `` `db`.`table` ``.
///
/// On-disk metadata files name tables without a database (sometimes as a
/// bare `_`), so statements must be re-qualified before execution.
pub fn qualify(sql: &str, database: &str, table: &str) -> String {
	match head_re().captures(sql) {
		Some(caps) => {
			// UNWRAP: the name group always participates in a match
			let name = caps.name("name").unwrap();
			format!(
				"{}{}.{}{}",
				&sql[..name.start()],
				quote_ident(database),
				quote_ident(table),
				&sql[name.end()..]
			)
		}
		None => sql.to_string(),
	}
}

/// Turn a create statement into its ATTACH form.
pub fn to_attach_query(sql: &str) -> String {
	match head_re().captures(sql) {
		Some(caps) => {
			// UNWRAP: these groups always participate in a match
			let kind = caps.name("kind").unwrap().as_str();
			let name = caps.name("name").unwrap();
			format!("ATTACH {kind} {}{}", name.as_str(), &sql[name.end()..])
		}
		None => sql.to_string(),
	}
}

/// Turn an attach statement into its CREATE form.
pub fn to_create_query(sql: &str) -> String {
	match head_re().captures(sql) {
		Some(caps) => {
			// UNWRAP: these groups always participate in a match
			let kind = caps.name("kind").unwrap().as_str();
			let name = caps.name("name").unwrap();
			format!("CREATE {kind} {}{}", name.as_str(), &sql[name.end()..])
		}
		None => sql.to_string(),
	}
}

/// Insert a `UUID '…'` clause after the table name, unless one is present.
pub fn add_uuid(sql: &str, uuid: &str) -> String {
	if uuid_clause_re().is_match(sql) {
		return sql.to_string();
	}
	match head_re().captures(sql) {
		Some(caps) => {
			// UNWRAP: the name group always participates in a match
			let name = caps.name("name").unwrap();
			format!(
				"{} UUID '{uuid}'{}",
				&sql[..name.end()],
				&sql[name.end()..]
			)
		}
		None => sql.to_string(),
	}
}

/// Attach the inner-table UUID of a materialized view, after the view's own
/// UUID clause.
pub fn add_inner_uuid(sql: &str, inner_uuid: &str) -> String {
	if inner_uuid_clause_re().is_match(sql) {
		return sql.to_string();
	}
	match uuid_clause_re().find(sql) {
		Some(found) => format!(
			"{} TO INNER UUID '{inner_uuid}'{}",
			&sql[..found.end()],
			&sql[found.end()..]
		),
		None => sql.to_string(),
	}
}

/// Replace Replicated*MergeTree engines with their plain counterparts,
/// dropping the ZooKeeper path and replica arguments.
pub fn force_non_replicated(sql: &str) -> String {
	replicated_engine_re()
		.replace_all(sql, |caps: &regex::Captures<'_>| {
			format!("{}(", &caps["engine"])
		})
		.into_owned()
}

/// Replace the replica-name argument of replicated engines.
pub fn override_replica_name(sql: &str, replica: &str) -> String {
	replica_arg_re()
		.replace_all(sql, |caps: &regex::Captures<'_>| {
			format!("{}'{replica}'", &caps["prefix"])
		})
		.into_owned()
}

/// ZooKeeper path and replica name of a replicated engine definition.
pub fn replicated_zookeeper_path(sql: &str) -> Option<(String, String)> {
	static RE: OnceLock<Regex> = OnceLock::new();
	let re = RE.get_or_init(|| {
		// UNWRAP: static pattern
		Regex::new(
			r"Replicated[A-Za-z]*MergeTree\s*\(\s*'(?P<path>[^']+)'\s*,\s*'(?P<replica>[^']+)'",
		)
		.unwrap()
	});
	re.captures(sql)
		.map(|caps| (caps["path"].to_string(), caps["replica"].to_string()))
}

/// Whether two create statements define the same schema, ignoring UUID
/// clauses, the ATTACH/CREATE verb, and whitespace.
pub fn compare_schema(left: &str, right: &str) -> bool {
	normalize(left) == normalize(right)
}

fn normalize(sql: &str) -> String {
	let sql = to_create_query(sql);
	let sql = inner_uuid_clause_re().replace_all(&sql, "");
	let sql = uuid_clause_re().replace_all(&sql, "");
	sql.split_whitespace()
		.collect::<Vec<_>>()
		.join(" ")
		.trim_end_matches(';')
		.trim()
		.to_string()
}

/// Expand `{macro}` placeholders. Unresolved macros are an error, since a
/// half-expanded ZooKeeper path must never be deleted.
pub fn resolve_macros(input: &str, macros: &BTreeMap<String, String>) -> Result<String> {
	static RE: OnceLock<Regex> = OnceLock::new();
	// UNWRAP: static pattern
	let re = RE.get_or_init(|| Regex::new(r"\{([^{}]+)\}").unwrap());

	let mut missing = Vec::new();
	let resolved = re
		.replace_all(input, |caps: &regex::Captures<'_>| {
			match macros.get(&caps[1]) {
				Some(value) => value.clone(),
				None => {
					missing.push(caps[1].to_string());
					caps[0].to_string()
				}
			}
		})
		.into_owned();

	if missing.is_empty() {
		Ok(resolved)
	} else {
		Err(Error::validation(format!(
			"unresolved macros in {input:?}: {}",
			missing.join(", ")
		)))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	const REPLICATED: &str = "CREATE TABLE db1.t1 UUID '11111111-2222-3333-4444-555555555555' (`n` UInt64) ENGINE = ReplicatedMergeTree('/clickhouse/tables/{shard}/db1.t1', '{replica}') ORDER BY n";

	#[test]
	fn engine_families() {
		assert!(is_merge_tree("ReplicatedVersionedCollapsingMergeTree"));
		assert!(is_merge_tree("MergeTree"));
		assert!(!is_merge_tree("Distributed"));
		assert!(is_replicated("ReplicatedMergeTree"));
		assert!(is_view("MaterializedView"));
		assert!(is_materialized_view("MaterializedView"));
		assert!(!is_view("MergeTree"));
		assert!(is_dictionary("Dictionary"));
	}

	#[test]
	fn attach_and_create_convert_both_ways() {
		let attach = to_attach_query(REPLICATED);
		assert!(attach.starts_with("ATTACH TABLE db1.t1"), "{attach}");
		let create = to_create_query(&attach);
		assert!(create.starts_with("CREATE TABLE db1.t1"), "{create}");

		let replace = "CREATE OR REPLACE TABLE db1.t1 (n Int8) ENGINE = Memory";
		assert!(to_attach_query(replace).starts_with("ATTACH TABLE db1.t1"));
	}

	#[test]
	fn qualify_rewrites_metadata_file_heads() {
		let on_disk = "ATTACH TABLE _ UUID 'aaaaaaaa-0000-0000-0000-000000000000'\n(\n    `n` UInt64\n)\nENGINE = MergeTree\nORDER BY n";
		let qualified = qualify(on_disk, "db1", "t1");
		assert!(
			qualified.starts_with("ATTACH TABLE `db1`.`t1` UUID 'aaaaaaaa"),
			"{qualified}"
		);
	}

	#[test]
	fn uuid_added_only_when_absent() {
		let bare = "ATTACH TABLE `db1`.`t1` (`n` UInt64) ENGINE = MergeTree ORDER BY n";
		let with = add_uuid(bare, "aaaaaaaa-0000-0000-0000-000000000000");
		assert!(
			with.starts_with("ATTACH TABLE `db1`.`t1` UUID 'aaaaaaaa"),
			"{with}"
		);
		assert_eq!(add_uuid(&with, "bbbbbbbb-0000-0000-0000-000000000000"), with);

		let inner = add_inner_uuid(&with, "cccccccc-0000-0000-0000-000000000000");
		assert!(
			inner.contains("UUID 'aaaaaaaa-0000-0000-0000-000000000000' TO INNER UUID 'cccccccc"),
			"{inner}"
		);
	}

	#[test]
	fn force_non_replicated_strips_replication_args() {
		let plain = force_non_replicated(REPLICATED);
		assert!(plain.contains("ENGINE = MergeTree()"), "{plain}");
		assert!(!plain.contains("Replicated"), "{plain}");

		let with_args = "ENGINE = ReplicatedVersionedCollapsingMergeTree('/path', 'r1', sign, version) ORDER BY n";
		let plain = force_non_replicated(with_args);
		assert!(
			plain.contains("ENGINE = VersionedCollapsingMergeTree(sign, version)"),
			"{plain}"
		);
	}

	#[test]
	fn replica_name_is_overridden_in_place() {
		let renamed = override_replica_name(REPLICATED, "host2");
		assert!(
			renamed.contains("ReplicatedMergeTree('/clickhouse/tables/{shard}/db1.t1', 'host2')"),
			"{renamed}"
		);
		assert!(is_replicated_statement(renamed.as_str()));
	}

	#[test]
	fn zookeeper_paths_are_extracted() {
		let (path, replica) = replicated_zookeeper_path(REPLICATED).unwrap();
		assert_eq!(path, "/clickhouse/tables/{shard}/db1.t1");
		assert_eq!(replica, "{replica}");
		assert!(replicated_zookeeper_path("ENGINE = MergeTree ORDER BY n").is_none());
	}

	#[test]
	fn schema_comparison_ignores_uuid_verb_and_whitespace() {
		let stored = "ATTACH TABLE `db1`.`t1` UUID 'aaaaaaaa-0000-0000-0000-000000000000'\n(\n    `n` UInt64\n)\nENGINE = MergeTree ORDER BY n";
		let live = "CREATE TABLE `db1`.`t1` (`n` UInt64) ENGINE = MergeTree ORDER BY n";
		assert!(compare_schema(stored, live));

		let other = "CREATE TABLE `db1`.`t1` (`n` UInt32) ENGINE = MergeTree ORDER BY n";
		assert!(!compare_schema(stored, other));
	}

	#[test]
	fn macros_resolve_or_fail_loudly() {
		let macros = BTreeMap::from([
			("shard".to_string(), "01".to_string()),
			("replica".to_string(), "host1".to_string()),
		]);
		assert_eq!(
			resolve_macros("/clickhouse/tables/{shard}/t/replicas/{replica}", &macros).unwrap(),
			"/clickhouse/tables/01/t/replicas/host1"
		);
		assert!(resolve_macros("/tables/{unknown}/x", &macros).is_err());
	}
}
