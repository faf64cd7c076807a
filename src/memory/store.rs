//! SQLite-backed hypergraph memory store implementation.

use crate::error::{Error, Result};
use crate::memory::schema::{initialize_schema, is_initialized};
use crate::memory::types::*;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::instrument;

/// SQLite-backed memory store.
#[derive(Clone)]
pub struct SqliteMemoryStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteMemoryStore {
    /// Open or create a memory store at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;

        if !is_initialized(&conn) {
            initialize_schema(&conn).map_err(|e| Error::MemoryStorage(e.to_string()))?;
        }

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create an in-memory store (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        initialize_schema(&conn).map_err(|e| Error::MemoryStorage(e.to_string()))?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| Error::Internal(format!("failed to lock connection: {e}")))?;
        f(&conn).map_err(|e| Error::MemoryStorage(e.to_string()))
    }

    // ==================== Node Operations ====================

    /// Add a node to the store.
    #[instrument(skip(self, node), fields(node_id = %node.id))]
    pub fn create_node(&self, node: &Node) -> Result<()> {
        self.with_conn(|conn| {
            let metadata = node
                .metadata
                .as_ref()
                .map(|m| serde_json::to_string(m).unwrap_or_default());

            conn.execute(
                "INSERT INTO nodes (
                    id, node_type, subtype, content, tier, confidence,
                    provenance_source, provenance_file, provenance_line, provenance_branch, provenance_commit_hash,
                    created_at, updated_at, last_accessed, access_count, metadata
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
                params![
                    node.id.to_string(),
                    node.node_type.to_string(),
                    node.subtype,
                    node.content,
                    node.tier as i32,
                    node.confidence,
                    node.provenance.as_ref().map(|p| p.source.clone()),
                    node.provenance.as_ref().and_then(|p| p.file.clone()),
                    node.provenance.as_ref().and_then(|p| p.line),
                    node.provenance.as_ref().and_then(|p| p.branch.clone()),
                    node.provenance.as_ref().and_then(|p| p.commit_hash.clone()),
                    node.created_at.to_rfc3339(),
                    node.updated_at.to_rfc3339(),
                    node.last_accessed.to_rfc3339(),
                    node.access_count as i64,
                    metadata,
                ],
            )?;

            if let Some(embedding) = &node.embedding {
                Self::upsert_embedding_internal(conn, &node.id, "default", embedding)?;
            }

            Ok(())
        })
    }

    /// Get a node by ID. Does not bump access count; see [`Self::increment_access`].
    pub fn get_node(&self, id: &NodeId) -> Result<Option<Node>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, node_type, subtype, content, tier, confidence,
                        provenance_source, provenance_file, provenance_line, provenance_branch, provenance_commit_hash,
                        created_at, updated_at, last_accessed, access_count, metadata
                 FROM nodes WHERE id = ?1",
                params![id.to_string()],
                Self::row_to_node,
            )
            .optional()
        })
    }

    /// Update a node in place.
    pub fn update_node(&self, node: &Node) -> Result<()> {
        self.with_conn(|conn| {
            let metadata = node
                .metadata
                .as_ref()
                .map(|m| serde_json::to_string(m).unwrap_or_default());

            conn.execute(
                "UPDATE nodes SET
                    content = ?2, tier = ?3, confidence = ?4,
                    updated_at = ?5, last_accessed = ?6, access_count = ?7, metadata = ?8
                 WHERE id = ?1",
                params![
                    node.id.to_string(),
                    node.content,
                    node.tier as i32,
                    node.confidence.clamp(0.0, 1.0),
                    node.updated_at.to_rfc3339(),
                    node.last_accessed.to_rfc3339(),
                    node.access_count as i64,
                    metadata,
                ],
            )?;
            Ok(())
        })
    }

    /// Delete a node. Cascades to memberships, embeddings, evolution log and
    /// decision rows via `ON DELETE CASCADE`.
    pub fn delete_node(&self, id: &NodeId) -> Result<bool> {
        self.with_conn(|conn| {
            let rows = conn.execute("DELETE FROM nodes WHERE id = ?1", params![id.to_string()])?;
            Ok(rows > 0)
        })
    }

    /// Atomically increment a node's access count and bump `last_accessed`.
    pub fn increment_access(&self, id: &NodeId) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE nodes SET access_count = access_count + 1, last_accessed = ?2 WHERE id = ?1",
                params![id.to_string(), Utc::now().to_rfc3339()],
            )?;
            Ok(())
        })
    }

    /// Count nodes matching a query (ignoring `limit`/`offset`).
    pub fn count_nodes(&self, query: &NodeQuery) -> Result<u64> {
        self.with_conn(|conn| {
            let (sql, params_vec) = build_node_filter(
                "SELECT COUNT(*) FROM nodes WHERE 1=1",
                query,
                /* with_order_limit */ false,
            );
            let params_refs: Vec<&dyn rusqlite::ToSql> =
                params_vec.iter().map(|b| b.as_ref()).collect();
            let count: i64 = conn.query_row(&sql, params_refs.as_slice(), |row| row.get(0))?;
            Ok(count as u64)
        })
    }

    /// List nodes matching a query: types, subtypes (union when
    /// `subtype_union`), tiers, min confidence.
    pub fn list_nodes(&self, query: &NodeQuery) -> Result<Vec<Node>> {
        self.with_conn(|conn| {
            let select = "SELECT id, node_type, subtype, content, tier, confidence,
                        provenance_source, provenance_file, provenance_line, provenance_branch, provenance_commit_hash,
                        created_at, updated_at, last_accessed, access_count, metadata
                 FROM nodes WHERE 1=1";
            let (sql, params_vec) = build_node_filter(select, query, true);
            let params_refs: Vec<&dyn rusqlite::ToSql> =
                params_vec.iter().map(|b| b.as_ref()).collect();

            let mut stmt = conn.prepare(&sql)?;
            let nodes = stmt
                .query_map(params_refs.as_slice(), Self::row_to_node)?
                .filter_map(|r| r.ok())
                .collect();

            Ok(nodes)
        })
    }

    /// Nodes ordered by recency blended with access count:
    /// `score = access_count + recency_weight`, where recency_weight decays
    /// with hours since last access.
    pub fn recent_nodes(&self, limit: u64, tiers: Option<Vec<Tier>>) -> Result<Vec<Node>> {
        self.with_conn(|conn| {
            let mut sql = String::from(
                "SELECT id, node_type, subtype, content, tier, confidence,
                        provenance_source, provenance_file, provenance_line, provenance_branch, provenance_commit_hash,
                        created_at, updated_at, last_accessed, access_count, metadata
                 FROM nodes WHERE 1=1",
            );
            let mut params_vec: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
            if let Some(tiers) = &tiers {
                push_in_clause(&mut sql, "tier", tiers.len());
                for t in tiers {
                    params_vec.push(Box::new(*t as i32));
                }
            }
            sql.push_str(
                " ORDER BY (access_count * 1.0) + (1.0 / (1.0 + (julianday('now') - julianday(last_accessed)) * 24.0)) DESC LIMIT ?",
            );
            params_vec.push(Box::new(limit as i64));

            let params_refs: Vec<&dyn rusqlite::ToSql> =
                params_vec.iter().map(|b| b.as_ref()).collect();
            let mut stmt = conn.prepare(&sql)?;
            let nodes = stmt
                .query_map(params_refs.as_slice(), Self::row_to_node)?
                .filter_map(|r| r.ok())
                .collect();
            Ok(nodes)
        })
    }

    /// Full-text search on content (keyword ranking for `SearchByContent`).
    pub fn search_content(&self, query: &str, limit: usize) -> Result<Vec<Node>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT n.id, n.node_type, n.subtype, n.content, n.tier, n.confidence,
                        n.provenance_source, n.provenance_file, n.provenance_line, n.provenance_branch, n.provenance_commit_hash,
                        n.created_at, n.updated_at, n.last_accessed, n.access_count, n.metadata
                 FROM nodes n
                 JOIN nodes_fts fts ON n.rowid = fts.rowid
                 WHERE nodes_fts MATCH ?1
                 ORDER BY rank
                 LIMIT ?2",
            )?;

            let nodes = stmt
                .query_map(params![query, limit as i64], Self::row_to_node)?
                .filter_map(|r| r.ok())
                .collect();

            Ok(nodes)
        })
    }

    /// Nodes reachable from `start` via hyperedge membership within
    /// `opts.max_depth` hops, honoring `opts.direction` and `opts.tiers`.
    pub fn get_connected(&self, start: &NodeId, opts: &ConnectedOptions) -> Result<Vec<Node>> {
        self.with_conn(|conn| {
            let mut visited: HashMap<String, ()> = HashMap::new();
            visited.insert(start.to_string(), ());
            let mut frontier = vec![start.to_string()];
            let mut found: Vec<String> = Vec::new();

            for _ in 0..opts.max_depth {
                if frontier.is_empty() {
                    break;
                }
                let mut next_frontier = Vec::new();
                for node_id in &frontier {
                    let neighbors = Self::neighbors_of(conn, node_id, opts.direction)?;
                    for n in neighbors {
                        if visited.insert(n.clone(), ()).is_none() {
                            found.push(n.clone());
                            next_frontier.push(n);
                        }
                    }
                }
                frontier = next_frontier;
            }

            let mut nodes = Vec::new();
            for id in found {
                if let Some(node) = conn
                    .query_row(
                        "SELECT id, node_type, subtype, content, tier, confidence,
                                provenance_source, provenance_file, provenance_line, provenance_branch, provenance_commit_hash,
                                created_at, updated_at, last_accessed, access_count, metadata
                         FROM nodes WHERE id = ?1",
                        params![id],
                        Self::row_to_node,
                    )
                    .optional()?
                {
                    if opts
                        .tiers
                        .as_ref()
                        .map(|tiers| tiers.contains(&node.tier))
                        .unwrap_or(true)
                    {
                        nodes.push(node);
                    }
                }
            }
            Ok(nodes)
        })
    }

    fn neighbors_of(
        conn: &Connection,
        node_id: &str,
        direction: Direction,
    ) -> rusqlite::Result<Vec<String>> {
        // Hyperedges are n-ary, so "direction" distinguishes whether the
        // starting node is a Subject (outgoing: reach Object/Context peers)
        // or an Object (incoming: reach Subject peers).
        let mut out = Vec::new();
        let mut stmt = conn.prepare(
            "SELECT m2.node_id, m1.role, m2.role
             FROM membership m1
             JOIN membership m2 ON m1.hyperedge_id = m2.hyperedge_id AND m2.node_id != m1.node_id
             WHERE m1.node_id = ?1",
        )?;
        let rows = stmt.query_map(params![node_id], |row| {
            let other_id: String = row.get(0)?;
            let my_role: String = row.get(1)?;
            let their_role: String = row.get(2)?;
            Ok((other_id, my_role, their_role))
        })?;
        for row in rows.filter_map(|r| r.ok()) {
            let (other_id, my_role, _their_role) = row;
            let matches = match direction {
                Direction::Both => true,
                Direction::Outgoing => my_role == "subject",
                Direction::Incoming => my_role == "object",
            };
            if matches {
                out.push(other_id);
            }
        }
        Ok(out)
    }

    fn row_to_node(row: &rusqlite::Row) -> rusqlite::Result<Node> {
        let id_str: String = row.get(0)?;
        let node_type_str: String = row.get(1)?;
        let tier_int: i32 = row.get(4)?;

        let metadata: Option<HashMap<String, Value>> = row
            .get::<_, Option<String>>(15)?
            .and_then(|s| serde_json::from_str(&s).ok());

        let provenance_source: Option<String> = row.get(6)?;
        let provenance = provenance_source.map(|source| Provenance {
            source,
            file: row.get(7).ok().flatten(),
            line: row.get::<_, Option<i64>>(8).ok().flatten().map(|l| l as u32),
            branch: row.get(9).ok().flatten(),
            commit_hash: row.get(10).ok().flatten(),
        });

        Ok(Node {
            id: NodeId::parse(&id_str).unwrap_or_else(|_| NodeId::new()),
            node_type: NodeType::parse(&node_type_str),
            subtype: row.get(2)?,
            content: row.get(3)?,
            embedding: None,
            tier: Tier::from_i32(tier_int),
            confidence: row.get(5)?,
            provenance,
            metadata,
            created_at: parse_datetime(row.get::<_, String>(11)?),
            updated_at: parse_datetime(row.get::<_, String>(12)?),
            last_accessed: parse_datetime(row.get::<_, String>(13)?),
            access_count: row.get::<_, i64>(14)? as u64,
        })
    }

    // ==================== Embedding Operations ====================

    fn upsert_embedding_internal(
        conn: &Connection,
        node_id: &NodeId,
        model: &str,
        embedding: &[f32],
    ) -> rusqlite::Result<()> {
        let blob: Vec<u8> = embedding.iter().flat_map(|f| f.to_le_bytes()).collect();
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO node_embeddings (node_id, model, embedding, dimensions, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)
             ON CONFLICT(node_id, model) DO UPDATE SET embedding = excluded.embedding,
                dimensions = excluded.dimensions, updated_at = excluded.updated_at",
            params![node_id.to_string(), model, blob, embedding.len() as i64, now],
        )?;
        Ok(())
    }

    /// Insert or replace the embedding for `(node_id, model)`. Idempotent.
    pub fn upsert_embedding(&self, node_id: &NodeId, model: &str, embedding: &[f32]) -> Result<()> {
        self.with_conn(|conn| Self::upsert_embedding_internal(conn, node_id, model, embedding))
    }

    /// Fetch a single node's embedding for the given model.
    pub fn get_embedding(&self, node_id: &NodeId, model: &str) -> Result<Option<Vec<f32>>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT embedding FROM node_embeddings WHERE node_id = ?1 AND model = ?2",
                params![node_id.to_string(), model],
                |row| {
                    let blob: Vec<u8> = row.get(0)?;
                    Ok(decode_embedding(&blob))
                },
            )
            .optional()
        })
    }

    /// All `(node_id, embedding)` pairs for a model, used for brute-force
    /// cosine search.
    pub fn all_embeddings(&self, model: &str) -> Result<Vec<(NodeId, Vec<f32>)>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare("SELECT node_id, embedding FROM node_embeddings WHERE model = ?1")?;
            let rows = stmt
                .query_map(params![model], |row| {
                    let id_str: String = row.get(0)?;
                    let blob: Vec<u8> = row.get(1)?;
                    Ok((
                        NodeId::parse(&id_str).unwrap_or_else(|_| NodeId::new()),
                        decode_embedding(&blob),
                    ))
                })?
                .filter_map(|r| r.ok())
                .collect();
            Ok(rows)
        })
    }

    // ==================== Edge Operations ====================

    /// Add a hyperedge and its memberships. Rejects edges that don't carry
    /// at least one Subject and one Object member.
    pub fn create_hyperedge(&self, edge: &HyperEdge) -> Result<()> {
        edge.validate()?;
        self.with_conn(|conn| {
            let metadata = edge
                .metadata
                .as_ref()
                .map(|m| serde_json::to_string(m).unwrap_or_default());

            conn.execute(
                "INSERT INTO hyperedges (id, edge_type, label, weight, created_at, metadata)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    edge.id.to_string(),
                    edge.edge_type.to_string(),
                    edge.label,
                    edge.weight,
                    edge.created_at.to_rfc3339(),
                    metadata,
                ],
            )?;

            for member in &edge.members {
                conn.execute(
                    "INSERT INTO membership (hyperedge_id, node_id, role, position)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![
                        edge.id.to_string(),
                        member.node_id.to_string(),
                        member.role.to_string(),
                        member.position,
                    ],
                )?;
            }

            Ok(())
        })
    }

    /// Add a member to an existing hyperedge.
    pub fn add_member(&self, edge_id: &EdgeId, member: &EdgeMember) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO membership (hyperedge_id, node_id, role, position)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    edge_id.to_string(),
                    member.node_id.to_string(),
                    member.role.to_string(),
                    member.position,
                ],
            )?;
            Ok(())
        })
    }

    /// Members of a hyperedge ordered by position.
    pub fn get_members(&self, edge_id: &EdgeId) -> Result<Vec<EdgeMember>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT node_id, role, position FROM membership WHERE hyperedge_id = ?1 ORDER BY position",
            )?;
            let members = stmt
                .query_map(params![edge_id.to_string()], |row| {
                    let node_id_str: String = row.get(0)?;
                    let role_str: String = row.get(1)?;
                    Ok(EdgeMember {
                        node_id: NodeId::parse(&node_id_str).unwrap_or_else(|_| NodeId::new()),
                        role: MemberRole::parse(&role_str),
                        position: row.get(2)?,
                    })
                })?
                .filter_map(|r| r.ok())
                .collect();
            Ok(members)
        })
    }

    /// Hyperedges that include `node_id` as a member.
    pub fn get_node_hyperedges(&self, node_id: &NodeId) -> Result<Vec<HyperEdge>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT DISTINCT e.id, e.edge_type, e.label, e.weight, e.created_at, e.metadata
                 FROM hyperedges e
                 JOIN membership m ON e.id = m.hyperedge_id
                 WHERE m.node_id = ?1",
            )?;

            let edge_ids: Vec<String> = stmt
                .query_map(params![node_id.to_string()], |row| row.get(0))?
                .filter_map(|r| r.ok())
                .collect();

            let mut edges = Vec::new();
            for edge_id in edge_ids {
                if let Some(edge) = self.get_edge_internal(conn, &edge_id)? {
                    edges.push(edge);
                }
            }

            Ok(edges)
        })
    }

    fn get_edge_internal(
        &self,
        conn: &Connection,
        edge_id: &str,
    ) -> rusqlite::Result<Option<HyperEdge>> {
        let edge_opt = conn
            .query_row(
                "SELECT id, edge_type, label, weight, created_at, metadata
                 FROM hyperedges WHERE id = ?1",
                params![edge_id],
                |row| {
                    let edge_type_str: String = row.get(1)?;
                    Ok(HyperEdge {
                        id: EdgeId::parse(&row.get::<_, String>(0)?)
                            .unwrap_or_else(|_| EdgeId::new()),
                        edge_type: EdgeType::parse(&edge_type_str),
                        label: row.get(2)?,
                        weight: row.get(3)?,
                        members: Vec::new(),
                        created_at: parse_datetime(row.get::<_, String>(4)?),
                        metadata: row
                            .get::<_, Option<String>>(5)?
                            .and_then(|s| serde_json::from_str(&s).ok()),
                    })
                },
            )
            .optional()?;

        if let Some(mut edge) = edge_opt {
            let mut stmt = conn.prepare(
                "SELECT node_id, role, position FROM membership WHERE hyperedge_id = ?1 ORDER BY position",
            )?;
            edge.members = stmt
                .query_map(params![edge_id], |row| {
                    let node_id_str: String = row.get(0)?;
                    let role_str: String = row.get(1)?;
                    Ok(EdgeMember {
                        node_id: NodeId::parse(&node_id_str).unwrap_or_else(|_| NodeId::new()),
                        role: MemberRole::parse(&role_str),
                        position: row.get(2)?,
                    })
                })?
                .filter_map(|r| r.ok())
                .collect();

            Ok(Some(edge))
        } else {
            Ok(None)
        }
    }

    /// Delete an edge and its memberships (cascade).
    pub fn delete_edge(&self, id: &EdgeId) -> Result<bool> {
        self.with_conn(|conn| {
            let rows = conn.execute(
                "DELETE FROM hyperedges WHERE id = ?1",
                params![id.to_string()],
            )?;
            Ok(rows > 0)
        })
    }

    // ==================== Decision side-table (reasoning trace) ====================

    /// Insert the decision-graph side row for a node (goal/decision/option/
    /// action/outcome).
    pub fn create_decision(&self, record: &DecisionRecord) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO decisions (node_id, decision_type, confidence, prompt, files_json, branch, commit_hash, parent_id, status)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    record.node_id.to_string(),
                    record.decision_type,
                    record.confidence,
                    record.prompt,
                    record
                        .files
                        .as_ref()
                        .map(|f| serde_json::to_string(f).unwrap_or_default()),
                    record.branch,
                    record.commit_hash,
                    record.parent_id.as_ref().map(|p| p.to_string()),
                    record.status,
                ],
            )?;
            Ok(())
        })
    }

    /// Fetch the decision side row for a node.
    pub fn get_decision(&self, node_id: &NodeId) -> Result<Option<DecisionRecord>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT node_id, decision_type, confidence, prompt, files_json, branch, commit_hash, parent_id, status
                 FROM decisions WHERE node_id = ?1",
                params![node_id.to_string()],
                |row| {
                    let node_id_str: String = row.get(0)?;
                    let files_json: Option<String> = row.get(4)?;
                    let parent_str: Option<String> = row.get(7)?;
                    Ok(DecisionRecord {
                        node_id: NodeId::parse(&node_id_str).unwrap_or_else(|_| NodeId::new()),
                        decision_type: row.get(1)?,
                        confidence: row.get(2)?,
                        prompt: row.get(3)?,
                        files: files_json.and_then(|s| serde_json::from_str(&s).ok()),
                        branch: row.get(5)?,
                        commit_hash: row.get(6)?,
                        parent_id: parent_str.and_then(|s| NodeId::parse(&s).ok()),
                        status: row.get(8)?,
                    })
                },
            )
            .optional()
        })
    }

    /// Update the status of a decision-graph node (e.g. option -> "completed"/"rejected").
    pub fn update_decision_status(&self, node_id: &NodeId, status: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE decisions SET status = ?2 WHERE node_id = ?1",
                params![node_id.to_string(), status],
            )?;
            Ok(())
        })
    }

    /// All decision-side rows of a given type spawned (transitively, via
    /// `parent_id`) from `parent`.
    pub fn decisions_by_parent(&self, parent: &NodeId) -> Result<Vec<DecisionRecord>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT node_id, decision_type, confidence, prompt, files_json, branch, commit_hash, parent_id, status
                 FROM decisions WHERE parent_id = ?1",
            )?;
            let rows = stmt
                .query_map(params![parent.to_string()], |row| {
                    let node_id_str: String = row.get(0)?;
                    let files_json: Option<String> = row.get(4)?;
                    let parent_str: Option<String> = row.get(7)?;
                    Ok(DecisionRecord {
                        node_id: NodeId::parse(&node_id_str).unwrap_or_else(|_| NodeId::new()),
                        decision_type: row.get(1)?,
                        confidence: row.get(2)?,
                        prompt: row.get(3)?,
                        files: files_json.and_then(|s| serde_json::from_str(&s).ok()),
                        branch: row.get(5)?,
                        commit_hash: row.get(6)?,
                        parent_id: parent_str.and_then(|s| NodeId::parse(&s).ok()),
                        status: row.get(8)?,
                    })
                })?
                .filter_map(|r| r.ok())
                .collect();
            Ok(rows)
        })
    }

    // ==================== Evolution / Tier Operations ====================

    /// Promote nodes to the next tier forward.
    pub fn promote(&self, node_ids: &[NodeId], reason: &str) -> Result<Vec<NodeId>> {
        let mut promoted = Vec::new();

        for node_id in node_ids {
            if let Some(mut node) = self.get_node(node_id)? {
                if let Some(next_tier) = node.tier.next() {
                    let from_tier = node.tier;
                    node.tier = next_tier;
                    node.updated_at = Utc::now();
                    self.update_node(&node)?;
                    self.log_evolution(node_id, "promote", Some(from_tier), Some(next_tier), reason)?;
                    promoted.push(node_id.clone());
                }
            }
        }

        Ok(promoted)
    }

    /// Consolidate nodes from one tier to another, promoting all source
    /// nodes and recording a summary.
    pub fn consolidate(&self, from_tier: Tier, to_tier: Tier) -> Result<ConsolidationResult> {
        let nodes = self.list_nodes(&NodeQuery::new().tiers(vec![from_tier]))?;
        let source_ids: Vec<NodeId> = nodes.iter().map(|n| n.id.clone()).collect();

        let promoted = self.promote(
            &source_ids,
            &format!("consolidation from {from_tier} to {to_tier}"),
        )?;

        Ok(ConsolidationResult {
            source_nodes: source_ids,
            consolidated_node: None,
            promoted_nodes: promoted,
            archived_nodes: Vec::new(),
            summary: format!("consolidated from {from_tier} to {to_tier}"),
        })
    }

    fn log_evolution(
        &self,
        node_id: &NodeId,
        operation: &str,
        from_tier: Option<Tier>,
        to_tier: Option<Tier>,
        reason: &str,
    ) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO evolution_log (node_id, operation, from_tier, to_tier, reason)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    node_id.to_string(),
                    operation,
                    from_tier.map(|t| t as i32),
                    to_tier.map(|t| t as i32),
                    reason,
                ],
            )?;
            Ok(())
        })
    }

    /// Get evolution history for a node, most recent first.
    pub fn get_evolution_history(&self, node_id: &NodeId) -> Result<Vec<EvolutionEntry>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT operation, from_tier, to_tier, reason, created_at
                 FROM evolution_log WHERE node_id = ?1 ORDER BY created_at DESC",
            )?;

            let entries = stmt
                .query_map(params![node_id.to_string()], |row| {
                    Ok(EvolutionEntry {
                        operation: row.get(0)?,
                        from_tier: row.get::<_, Option<i32>>(1)?.map(Tier::from_i32),
                        to_tier: row.get::<_, Option<i32>>(2)?.map(Tier::from_i32),
                        reason: row.get(3)?,
                        timestamp: parse_datetime(row.get::<_, String>(4)?),
                    })
                })?
                .filter_map(|r| r.ok())
                .collect();

            Ok(entries)
        })
    }

    // ==================== Retrieval outcomes ====================

    /// Record a single retrieval outcome (hybrid search telemetry).
    pub fn record_outcome(&self, outcome: &RetrievalOutcome) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO retrieval_outcomes
                    (query_hash, query_type, node_id, node_type, node_subtype, relevance_score, was_used, context_tokens, latency_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    outcome.query_hash,
                    outcome.query_type,
                    outcome.node_id.to_string(),
                    outcome.node_type.to_string(),
                    outcome.node_subtype,
                    outcome.relevance_score,
                    outcome.was_used as i64,
                    outcome.context_tokens.map(|t| t as i64),
                    outcome.latency_ms.map(|t| t as i64),
                ],
            )?;
            Ok(())
        })
    }

    /// Mark a recorded outcome as having been used by the caller (feedback loop).
    pub fn mark_outcome_used(&self, query_hash: &str, node_id: &NodeId) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE retrieval_outcomes SET was_used = 1 WHERE query_hash = ?1 AND node_id = ?2",
                params![query_hash, node_id.to_string()],
            )?;
            Ok(())
        })
    }

    /// Get statistics about the memory store.
    pub fn stats(&self) -> Result<MemoryStats> {
        self.with_conn(|conn| {
            let total_nodes: i64 =
                conn.query_row("SELECT COUNT(*) FROM nodes", [], |row| row.get(0))?;

            let nodes_by_tier: HashMap<Tier, i64> = {
                let mut stmt = conn.prepare("SELECT tier, COUNT(*) FROM nodes GROUP BY tier")?;
                let rows = stmt.query_map([], |row| {
                    let tier_int: i32 = row.get(0)?;
                    let count: i64 = row.get(1)?;
                    Ok((Tier::from_i32(tier_int), count))
                })?;
                rows.filter_map(|r| r.ok()).collect()
            };

            let nodes_by_type: HashMap<NodeType, i64> = {
                let mut stmt =
                    conn.prepare("SELECT node_type, COUNT(*) FROM nodes GROUP BY node_type")?;
                let rows = stmt.query_map([], |row| {
                    let type_str: String = row.get(0)?;
                    let count: i64 = row.get(1)?;
                    Ok((NodeType::parse(&type_str), count))
                })?;
                rows.filter_map(|r| r.ok()).collect()
            };

            let total_edges: i64 =
                conn.query_row("SELECT COUNT(*) FROM hyperedges", [], |row| row.get(0))?;

            Ok(MemoryStats {
                total_nodes: total_nodes as u64,
                nodes_by_tier,
                nodes_by_type,
                total_edges: total_edges as u64,
            })
        })
    }
}

fn build_node_filter(
    base_sql: &str,
    query: &NodeQuery,
    with_order_limit: bool,
) -> (String, Vec<Box<dyn rusqlite::ToSql>>) {
    let mut sql = String::from(base_sql);
    let mut params_vec: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

    if let Some(types) = &query.node_types {
        push_in_clause(&mut sql, "node_type", types.len());
        for t in types {
            params_vec.push(Box::new(t.to_string()));
        }
    }

    if let Some(subtypes) = &query.subtypes {
        if query.subtype_union {
            push_in_clause(&mut sql, "subtype", subtypes.len());
            for s in subtypes {
                params_vec.push(Box::new(s.clone()));
            }
        } else if let Some(single) = subtypes.first() {
            sql.push_str(" AND subtype = ?");
            params_vec.push(Box::new(single.clone()));
        }
    }

    if let Some(tiers) = &query.tiers {
        push_in_clause(&mut sql, "tier", tiers.len());
        for t in tiers {
            params_vec.push(Box::new(*t as i32));
        }
    }

    if let Some(min_conf) = query.min_confidence {
        sql.push_str(" AND confidence >= ?");
        params_vec.push(Box::new(min_conf));
    }

    if with_order_limit {
        sql.push_str(" ORDER BY last_accessed DESC");
        if let Some(limit) = query.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }
        if let Some(offset) = query.offset {
            sql.push_str(&format!(" OFFSET {offset}"));
        }
    }

    (sql, params_vec)
}

fn push_in_clause(sql: &mut String, column: &str, count: usize) {
    let placeholders: Vec<&str> = std::iter::repeat("?").take(count).collect();
    sql.push_str(&format!(" AND {column} IN ({})", placeholders.join(",")));
}

fn decode_embedding(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks(4)
        .map(|chunk| {
            let arr: [u8; 4] = chunk.try_into().unwrap_or([0; 4]);
            f32::from_le_bytes(arr)
        })
        .collect()
}

fn parse_datetime(s: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

/// Side-table row for a decision-graph node (goal/decision/option/action/outcome).
#[derive(Debug, Clone)]
pub struct DecisionRecord {
    pub node_id: NodeId,
    pub decision_type: String,
    pub confidence: f64,
    pub prompt: Option<String>,
    pub files: Option<Vec<String>>,
    pub branch: Option<String>,
    pub commit_hash: Option<String>,
    pub parent_id: Option<NodeId>,
    pub status: String,
}

impl DecisionRecord {
    pub fn new(node_id: NodeId, decision_type: impl Into<String>) -> Self {
        Self {
            node_id,
            decision_type: decision_type.into(),
            confidence: 1.0,
            prompt: None,
            files: None,
            branch: None,
            commit_hash: None,
            parent_id: None,
            status: "active".to_string(),
        }
    }
}

/// A single retrieval-outcome telemetry record.
#[derive(Debug, Clone)]
pub struct RetrievalOutcome {
    pub query_hash: String,
    pub query_type: String,
    pub node_id: NodeId,
    pub node_type: NodeType,
    pub node_subtype: Option<String>,
    pub relevance_score: f64,
    pub was_used: bool,
    pub context_tokens: Option<u64>,
    pub latency_ms: Option<u64>,
}

/// Entry in the evolution log.
#[derive(Debug, Clone)]
pub struct EvolutionEntry {
    pub operation: String,
    pub from_tier: Option<Tier>,
    pub to_tier: Option<Tier>,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

/// Statistics about the memory store.
#[derive(Debug, Clone)]
pub struct MemoryStats {
    pub total_nodes: u64,
    pub nodes_by_tier: HashMap<Tier, i64>,
    pub nodes_by_type: HashMap<NodeType, i64>,
    pub total_edges: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_and_get_node() {
        let store = SqliteMemoryStore::in_memory().unwrap();
        let node = Node::new(NodeType::Fact, "Test fact");

        store.create_node(&node).unwrap();
        let retrieved = store.get_node(&node.id).unwrap().unwrap();

        assert_eq!(retrieved.content, "Test fact");
        assert_eq!(retrieved.node_type, NodeType::Fact);
    }

    #[test]
    fn test_query_nodes_by_type() {
        let store = SqliteMemoryStore::in_memory().unwrap();

        store.create_node(&Node::new(NodeType::Fact, "Fact 1")).unwrap();
        store.create_node(&Node::new(NodeType::Fact, "Fact 2")).unwrap();
        store.create_node(&Node::new(NodeType::Entity, "Entity 1")).unwrap();

        let facts = store
            .list_nodes(&NodeQuery::new().node_types(vec![NodeType::Fact]))
            .unwrap();

        assert_eq!(facts.len(), 2);
    }

    #[test]
    fn test_subtype_union_filter() {
        let store = SqliteMemoryStore::in_memory().unwrap();
        store
            .create_node(&Node::new(NodeType::Snippet, "a").with_subtype("diff"))
            .unwrap();
        store
            .create_node(&Node::new(NodeType::Snippet, "b").with_subtype("patch"))
            .unwrap();
        store
            .create_node(&Node::new(NodeType::Snippet, "c").with_subtype("note"))
            .unwrap();

        let matched = store
            .list_nodes(&NodeQuery::new().subtypes(vec!["diff".to_string(), "patch".to_string()]))
            .unwrap();
        assert_eq!(matched.len(), 2);
    }

    #[test]
    fn test_full_text_search() {
        let store = SqliteMemoryStore::in_memory().unwrap();

        store
            .create_node(&Node::new(NodeType::Fact, "The authentication system uses JWT"))
            .unwrap();
        store
            .create_node(&Node::new(NodeType::Fact, "Users can login with OAuth"))
            .unwrap();
        store
            .create_node(&Node::new(NodeType::Fact, "Database uses PostgreSQL"))
            .unwrap();

        let results = store.search_content("authentication", 10).unwrap();
        assert_eq!(results.len(), 1);
        assert!(results[0].content.contains("authentication"));
    }

    #[test]
    fn test_add_and_get_edge() {
        let store = SqliteMemoryStore::in_memory().unwrap();

        let node1 = Node::new(NodeType::Entity, "User");
        let node2 = Node::new(NodeType::Entity, "Session");
        store.create_node(&node1).unwrap();
        store.create_node(&node2).unwrap();

        let edge = HyperEdge::binary(EdgeType::Implements, node1.id.clone(), node2.id.clone(), "has");
        store.create_hyperedge(&edge).unwrap();

        let edges = store.get_node_hyperedges(&node1.id).unwrap();
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].label, Some("has".to_string()));
    }

    #[test]
    fn test_hyperedge_without_subject_and_object_rejected() {
        let store = SqliteMemoryStore::in_memory().unwrap();
        let node = Node::new(NodeType::Entity, "Solo");
        store.create_node(&node).unwrap();

        let lone = HyperEdge::new(
            EdgeType::Context,
            vec![EdgeMember::new(node.id.clone(), MemberRole::Context, 0)],
        );
        assert!(store.create_hyperedge(&lone).is_err());
    }

    #[test]
    fn test_get_connected() {
        let store = SqliteMemoryStore::in_memory().unwrap();
        let goal = Node::new(NodeType::Decision, "goal");
        let decision = Node::new(NodeType::Decision, "decision");
        store.create_node(&goal).unwrap();
        store.create_node(&decision).unwrap();
        store
            .create_hyperedge(&HyperEdge::binary(
                EdgeType::Spawns,
                goal.id.clone(),
                decision.id.clone(),
                "spawns",
            ))
            .unwrap();

        let connected = store
            .get_connected(&goal.id, &ConnectedOptions::default())
            .unwrap();
        assert_eq!(connected.len(), 1);
        assert_eq!(connected[0].id, decision.id);
    }

    #[test]
    fn test_increment_access_never_decreases() {
        let store = SqliteMemoryStore::in_memory().unwrap();
        let node = Node::new(NodeType::Fact, "x");
        store.create_node(&node).unwrap();

        store.increment_access(&node.id).unwrap();
        store.increment_access(&node.id).unwrap();

        let updated = store.get_node(&node.id).unwrap().unwrap();
        assert_eq!(updated.access_count, 2);
    }

    #[test]
    fn test_embedding_upsert_idempotent() {
        let store = SqliteMemoryStore::in_memory().unwrap();
        let node = Node::new(NodeType::Fact, "x");
        store.create_node(&node).unwrap();

        store.upsert_embedding(&node.id, "test-model", &[1.0, 2.0, 3.0]).unwrap();
        store.upsert_embedding(&node.id, "test-model", &[4.0, 5.0, 6.0]).unwrap();

        let emb = store.get_embedding(&node.id, "test-model").unwrap().unwrap();
        assert_eq!(emb, vec![4.0, 5.0, 6.0]);
    }

    #[test]
    fn test_promote() {
        let store = SqliteMemoryStore::in_memory().unwrap();

        let node = Node::new(NodeType::Fact, "Test").with_tier(Tier::Task);
        store.create_node(&node).unwrap();

        let promoted = store.promote(&[node.id.clone()], "Test promotion").unwrap();
        assert_eq!(promoted.len(), 1);

        let updated = store.get_node(&node.id).unwrap().unwrap();
        assert_eq!(updated.tier, Tier::Session);
    }

    #[test]
    fn test_evolution_history() {
        let store = SqliteMemoryStore::in_memory().unwrap();

        let node = Node::new(NodeType::Fact, "Test").with_tier(Tier::Task);
        store.create_node(&node).unwrap();
        store.promote(&[node.id.clone()], "First promotion").unwrap();
        store.promote(&[node.id.clone()], "Second promotion").unwrap();

        let history = store.get_evolution_history(&node.id).unwrap();
        assert_eq!(history.len(), 2);
    }

    #[test]
    fn test_decision_record_roundtrip() {
        let store = SqliteMemoryStore::in_memory().unwrap();
        let node = Node::new(NodeType::Decision, "ship it");
        store.create_node(&node).unwrap();

        let mut record = DecisionRecord::new(node.id.clone(), "decision");
        record.status = "active".to_string();
        store.create_decision(&record).unwrap();

        store.update_decision_status(&node.id, "completed").unwrap();
        let fetched = store.get_decision(&node.id).unwrap().unwrap();
        assert_eq!(fetched.status, "completed");
    }

    #[test]
    fn test_stats() {
        let store = SqliteMemoryStore::in_memory().unwrap();

        store.create_node(&Node::new(NodeType::Fact, "F1")).unwrap();
        store
            .create_node(&Node::new(NodeType::Fact, "F2").with_tier(Tier::Session))
            .unwrap();
        store.create_node(&Node::new(NodeType::Entity, "E1")).unwrap();

        let stats = store.stats().unwrap();
        assert_eq!(stats.total_nodes, 3);
        assert_eq!(stats.nodes_by_type.get(&NodeType::Fact), Some(&2));
    }

    #[test]
    fn test_open_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("memory.db");

        {
            let store = SqliteMemoryStore::open(&path).unwrap();
            store.create_node(&Node::new(NodeType::Fact, "persisted fact")).unwrap();
        }

        let reopened = SqliteMemoryStore::open(&path).unwrap();
        let facts = reopened
            .list_nodes(&NodeQuery::new().node_types(vec![NodeType::Fact]))
            .unwrap();
        assert_eq!(facts.len(), 1);
        assert_eq!(facts[0].content, "persisted fact");
    }
}
