use crate::{slot_of, Node, Topology};
use lazy_static::lazy_static;
use std::collections::HashMap;
use std::sync::Arc;

/// Routing descriptor of one command: declared arity plus the positional
/// key span `first_key ..= last_key` with stride `key_step`. Commands whose
/// keys cannot be derived positionally carry `first_key == 0` and are
/// rejected by the router; commands the proxy refuses outright (pub/sub,
/// blocking, transactions, admin) are flagged unsupported.
#[derive(Debug)]
pub struct CommandDef {
    pub name: &'static str,
    pub arity: i32,
    pub first_key: i32,
    pub last_key: i32,
    pub key_step: i32,
    pub unsupported: bool,
}

const fn cmd(
    name: &'static str,
    arity: i32,
    first_key: i32,
    last_key: i32,
    key_step: i32,
) -> CommandDef {
    CommandDef {
        name,
        arity,
        first_key,
        last_key,
        key_step,
        unsupported: false,
    }
}

const fn deny(name: &'static str, arity: i32) -> CommandDef {
    CommandDef {
        name,
        arity,
        first_key: 0,
        last_key: 0,
        key_step: 0,
        unsupported: true,
    }
}

static COMMANDS: &[CommandDef] = &[
    // Connection.
    cmd("ping", 1, 0, 0, 0),
    cmd("echo", 2, 1, 1, 1),
    deny("auth", 2),
    deny("select", 2),
    deny("swapdb", 3),
    deny("quit", 1),
    // Strings.
    cmd("append", 3, 1, 1, 1),
    cmd("bitcount", -2, 1, 1, 1),
    cmd("bitfield", -2, 1, 1, 1),
    cmd("bitop", -4, 2, -1, 1),
    cmd("bitpos", -3, 1, 1, 1),
    cmd("decr", 2, 1, 1, 1),
    cmd("decrby", 3, 1, 1, 1),
    cmd("get", 2, 1, 1, 1),
    cmd("getbit", 3, 1, 1, 1),
    cmd("getrange", 4, 1, 1, 1),
    cmd("getset", 3, 1, 1, 1),
    cmd("incr", 2, 1, 1, 1),
    cmd("incrby", 3, 1, 1, 1),
    cmd("incrbyfloat", 3, 1, 1, 1),
    cmd("mget", -2, 1, -1, 1),
    cmd("mset", -3, 1, -1, 2),
    cmd("msetnx", -3, 1, -1, 2),
    cmd("psetex", 4, 1, 1, 1),
    cmd("set", -3, 1, 1, 1),
    cmd("setbit", 4, 1, 1, 1),
    cmd("setex", 4, 1, 1, 1),
    cmd("setnx", 3, 1, 1, 1),
    cmd("setrange", 4, 1, 1, 1),
    cmd("strlen", 2, 1, 1, 1),
    // Generic key commands.
    cmd("del", -2, 1, -1, 1),
    cmd("dump", 2, 1, 1, 1),
    cmd("exists", -2, 1, -1, 1),
    cmd("expire", 3, 1, 1, 1),
    cmd("expireat", 3, 1, 1, 1),
    cmd("persist", 2, 1, 1, 1),
    cmd("pexpire", 3, 1, 1, 1),
    cmd("pexpireat", 3, 1, 1, 1),
    cmd("pttl", 2, 1, 1, 1),
    cmd("rename", 3, 1, 2, 1),
    cmd("renamenx", 3, 1, 2, 1),
    cmd("restore", -4, 1, 1, 1),
    cmd("sort", -2, 1, 1, 1),
    cmd("touch", -2, 1, -1, 1),
    cmd("ttl", 2, 1, 1, 1),
    cmd("type", 2, 1, 1, 1),
    cmd("unlink", -2, 1, -1, 1),
    deny("keys", 2),
    deny("randomkey", 1),
    deny("scan", -2),
    deny("migrate", -6),
    deny("move", 3),
    deny("wait", 3),
    // Hashes.
    cmd("hdel", -3, 1, 1, 1),
    cmd("hexists", 3, 1, 1, 1),
    cmd("hget", 3, 1, 1, 1),
    cmd("hgetall", 2, 1, 1, 1),
    cmd("hincrby", 4, 1, 1, 1),
    cmd("hincrbyfloat", 4, 1, 1, 1),
    cmd("hkeys", 2, 1, 1, 1),
    cmd("hlen", 2, 1, 1, 1),
    cmd("hmget", -3, 1, 1, 1),
    cmd("hmset", -4, 1, 1, 1),
    cmd("hscan", -3, 1, 1, 1),
    cmd("hset", -4, 1, 1, 1),
    cmd("hsetnx", 4, 1, 1, 1),
    cmd("hstrlen", 3, 1, 1, 1),
    cmd("hvals", 2, 1, 1, 1),
    // Lists.
    cmd("lindex", 3, 1, 1, 1),
    cmd("linsert", 5, 1, 1, 1),
    cmd("llen", 2, 1, 1, 1),
    cmd("lpop", 2, 1, 1, 1),
    cmd("lpush", -3, 1, 1, 1),
    cmd("lpushx", -3, 1, 1, 1),
    cmd("lrange", 4, 1, 1, 1),
    cmd("lrem", 4, 1, 1, 1),
    cmd("lset", 4, 1, 1, 1),
    cmd("ltrim", 4, 1, 1, 1),
    cmd("rpop", 2, 1, 1, 1),
    cmd("rpoplpush", 3, 1, 2, 1),
    cmd("rpush", -3, 1, 1, 1),
    cmd("rpushx", -3, 1, 1, 1),
    deny("blpop", -3),
    deny("brpop", -3),
    deny("brpoplpush", 4),
    // Sets.
    cmd("sadd", -3, 1, 1, 1),
    cmd("scard", 2, 1, 1, 1),
    cmd("sdiff", -2, 1, -1, 1),
    cmd("sdiffstore", -3, 1, -1, 1),
    cmd("sinter", -2, 1, -1, 1),
    cmd("sinterstore", -3, 1, -1, 1),
    cmd("sismember", 3, 1, 1, 1),
    cmd("smembers", 2, 1, 1, 1),
    cmd("smove", 4, 1, 2, 1),
    cmd("spop", -2, 1, 1, 1),
    cmd("srandmember", -2, 1, 1, 1),
    cmd("srem", -3, 1, 1, 1),
    cmd("sscan", -3, 1, 1, 1),
    cmd("sunion", -2, 1, -1, 1),
    cmd("sunionstore", -3, 1, -1, 1),
    // Sorted sets. The *store variants take their key list behind a
    // numkeys argument, so no positional span exists for them.
    cmd("zadd", -4, 1, 1, 1),
    cmd("zcard", 2, 1, 1, 1),
    cmd("zcount", 4, 1, 1, 1),
    cmd("zincrby", 4, 1, 1, 1),
    cmd("zinterstore", -4, 0, 0, 0),
    cmd("zlexcount", 4, 1, 1, 1),
    cmd("zrange", -4, 1, 1, 1),
    cmd("zrangebylex", -4, 1, 1, 1),
    cmd("zrangebyscore", -4, 1, 1, 1),
    cmd("zrank", 3, 1, 1, 1),
    cmd("zrem", -3, 1, 1, 1),
    cmd("zremrangebylex", 4, 1, 1, 1),
    cmd("zremrangebyrank", 4, 1, 1, 1),
    cmd("zremrangebyscore", 4, 1, 1, 1),
    cmd("zrevrange", -4, 1, 1, 1),
    cmd("zrevrangebylex", -4, 1, 1, 1),
    cmd("zrevrangebyscore", -4, 1, 1, 1),
    cmd("zrevrank", 3, 1, 1, 1),
    cmd("zscan", -3, 1, 1, 1),
    cmd("zscore", 3, 1, 1, 1),
    cmd("zunionstore", -4, 0, 0, 0),
    // HyperLogLog.
    cmd("pfadd", -2, 1, 1, 1),
    cmd("pfcount", -2, 1, -1, 1),
    cmd("pfmerge", -2, 1, -1, 1),
    // Geo.
    cmd("geoadd", -5, 1, 1, 1),
    cmd("geodist", -4, 1, 1, 1),
    cmd("geohash", -2, 1, 1, 1),
    cmd("geopos", -2, 1, 1, 1),
    cmd("georadius", -6, 1, 1, 1),
    cmd("georadiusbymember", -5, 1, 1, 1),
    // Streams. Reads that fan out over a numkeys argument are rejected.
    cmd("xadd", -5, 1, 1, 1),
    cmd("xlen", 2, 1, 1, 1),
    cmd("xrange", -4, 1, 1, 1),
    cmd("xrevrange", -4, 1, 1, 1),
    cmd("xread", -4, 0, 0, 0),
    // Pub/sub and anything that blocks or spans the whole cluster.
    deny("subscribe", -2),
    deny("unsubscribe", -1),
    deny("psubscribe", -2),
    deny("punsubscribe", -1),
    deny("publish", 3),
    deny("pubsub", -2),
    // Transactions and scripting.
    deny("multi", 1),
    deny("exec", 1),
    deny("discard", 1),
    deny("watch", -2),
    deny("unwatch", 1),
    cmd("eval", -3, 0, 0, 0),
    cmd("evalsha", -3, 0, 0, 0),
    deny("script", -2),
    // Administration.
    deny("bgrewriteaof", 1),
    deny("bgsave", 1),
    deny("client", -2),
    deny("cluster", -2),
    deny("command", -1),
    deny("config", -2),
    deny("dbsize", 1),
    deny("debug", -2),
    deny("flushall", -1),
    deny("flushdb", -1),
    deny("info", -1),
    deny("lastsave", 1),
    deny("memory", -2),
    deny("monitor", 1),
    deny("replicaof", 3),
    deny("save", 1),
    deny("shutdown", -1),
    deny("slaveof", 3),
    deny("slowlog", -2),
    deny("time", 1),
];

lazy_static! {
    static ref COMMANDS_BY_NAME: HashMap<&'static str, &'static CommandDef> =
        COMMANDS.iter().map(|def| (def.name, def)).collect();
}

/// Look up a descriptor by its already-lowercased name.
pub fn lookup_command(name: &str) -> Option<&'static CommandDef> {
    COMMANDS_BY_NAME.get(name).copied()
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum RouteError {
    #[error("Unsupported command: '{0}'")]
    Unsupported(String),
    #[error("Queries with keys belonging to different nodes are not supported")]
    CrossNode,
    #[error("Failed to get node for query")]
    NoRoute,
}

/// A successfully routed request.
#[derive(Debug)]
pub struct Routed {
    pub command: &'static CommandDef,
    pub node: Arc<Node>,
    pub slot: Option<u16>,
}

/// Derive the target node for a parsed request.
///
/// Keyless single-argument requests go to the first mapped node. Otherwise
/// the command's key span is clamped into the argument range and walked;
/// every key must resolve to the same node.
pub fn route_request(topology: &Topology, frame: &resp::RequestFrame) -> Result<Routed, RouteError> {
    let name = String::from_utf8_lossy(frame.arg(0).unwrap_or_default()).to_lowercase();
    let command = lookup_command(&name).ok_or_else(|| RouteError::Unsupported(name.clone()))?;
    if command.unsupported || (command.arity != 1 && command.first_key == 0) {
        return Err(RouteError::Unsupported(name));
    }

    let argc = frame.argc() as i32;
    if argc == 1 {
        let node = topology.first_node().ok_or(RouteError::NoRoute)?;
        return Ok(Routed {
            command,
            node: node.clone(),
            slot: None,
        });
    }

    let mut first = command.first_key;
    if first == 0 {
        return Err(RouteError::NoRoute);
    }
    if first >= argc {
        first = argc - 1;
    }
    let mut last = command.last_key;
    if last < 0 || last >= argc {
        last = argc - 1;
    }
    if last < first {
        last = first;
    }
    let step = command.key_step.max(1);

    let mut node: Option<&Arc<Node>> = None;
    let mut slot = None;
    let mut at = first;
    while at <= last {
        let key = frame.arg(at as usize).unwrap_or_default();
        let key_slot = slot_of(key);
        let owner = topology.node_of_slot(key_slot).ok_or(RouteError::NoRoute)?;
        match node {
            None => node = Some(owner),
            Some(seen) if !Arc::ptr_eq(seen, owner) => return Err(RouteError::CrossNode),
            Some(_) => {}
        }
        slot = Some(key_slot);
        at += step;
    }
    let node = node.ok_or(RouteError::NoRoute)?;
    Ok(Routed {
        command,
        node: node.clone(),
        slot,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Topology;

    fn parse_one(wire: &[u8]) -> resp::RequestFrame {
        let mut parser = resp::RequestParser::new();
        parser.read_buf().extend_from_slice(wire);
        parser.next().unwrap().unwrap()
    }

    // Two primaries splitting the keyspace in half.
    fn two_node_topology() -> Topology {
        let text = "\
aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa 127.0.0.1:7001 master - 0 0 1 connected 0-8191
bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb 127.0.0.1:7002 master - 0 0 2 connected 8192-16383
";
        Topology::from_nodes_reply(text, None).unwrap()
    }

    #[test]
    fn test_single_key_routes_by_slot() {
        let topology = two_node_topology();
        let routed =
            route_request(&topology, &parse_one(b"*3\r\n$3\r\nSET\r\n$3\r\nfoo\r\n$3\r\nbar\r\n"))
                .unwrap();
        assert_eq!(routed.slot, Some(12182));
        assert_eq!(routed.node.port, 7002);
    }

    #[test]
    fn test_keyless_routes_to_first_node() {
        let topology = two_node_topology();
        let routed = route_request(&topology, &parse_one(b"*1\r\n$4\r\nPING\r\n")).unwrap();
        assert_eq!(routed.node.port, 7001);
        assert_eq!(routed.slot, None);
    }

    #[test]
    fn test_multi_key_same_node() {
        let topology = two_node_topology();
        let routed = route_request(
            &topology,
            &parse_one(b"*3\r\n$4\r\nMGET\r\n$6\r\n{u1}:a\r\n$6\r\n{u1}:b\r\n"),
        )
        .unwrap();
        assert_eq!(routed.slot, Some(crate::slot_of(b"u1")));
    }

    #[test]
    fn test_multi_key_cross_node_rejected() {
        let topology = two_node_topology();
        // "foo" and "bar" live on different halves of the keyspace.
        assert!(crate::slot_of(b"foo") >= 8192);
        assert!(crate::slot_of(b"bar") < 8192);
        let err = route_request(
            &topology,
            &parse_one(b"*3\r\n$4\r\nMGET\r\n$3\r\nfoo\r\n$3\r\nbar\r\n"),
        )
        .unwrap_err();
        assert_eq!(err, RouteError::CrossNode);
    }

    #[test]
    fn test_mset_steps_over_values() {
        let topology = two_node_topology();
        // MSET {t}a 1 {t}b 2: values must not be hashed as keys.
        let routed = route_request(
            &topology,
            &parse_one(
                b"*5\r\n$4\r\nMSET\r\n$4\r\n{t}a\r\n$3\r\nv-1\r\n$4\r\n{t}b\r\n$3\r\nv-2\r\n",
            ),
        )
        .unwrap();
        assert_eq!(routed.slot, Some(crate::slot_of(b"t")));
    }

    #[test]
    fn test_unknown_and_unsupported_commands() {
        let topology = two_node_topology();
        let err = route_request(&topology, &parse_one(b"*1\r\n$7\r\nNOTACMD\r\n")).unwrap_err();
        assert_eq!(err, RouteError::Unsupported("notacmd".to_string()));

        let err = route_request(
            &topology,
            &parse_one(b"*2\r\n$9\r\nSUBSCRIBE\r\n$2\r\nch\r\n"),
        )
        .unwrap_err();
        assert_eq!(err, RouteError::Unsupported("subscribe".to_string()));

        // No positional key span: rejected by the arity/first-key rule.
        let err = route_request(
            &topology,
            &parse_one(b"*4\r\n$4\r\nEVAL\r\n$1\r\n0\r\n$1\r\n0\r\n$1\r\nx\r\n"),
        )
        .unwrap_err();
        assert_eq!(err, RouteError::Unsupported("eval".to_string()));
    }

    #[test]
    fn test_no_route_for_unowned_slot() {
        let text = "\
aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa 127.0.0.1:7001 master - 0 0 1 connected 0-100
";
        let topology = Topology::from_nodes_reply(text, None).unwrap();
        assert!(crate::slot_of(b"foo") > 100);
        let err =
            route_request(&topology, &parse_one(b"*2\r\n$3\r\nGET\r\n$3\r\nfoo\r\n")).unwrap_err();
        assert_eq!(err, RouteError::NoRoute);
    }

    #[test]
    fn test_lookup_is_case_insensitive_at_the_caller() {
        assert!(lookup_command("get").is_some());
        assert!(lookup_command("GET").is_none());
    }
}
