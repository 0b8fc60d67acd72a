use std::fmt;

/// A single client request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Ping,
    Get(String),
    /// Values may contain spaces; everything after the key is the value.
    Set(String, String),
    Del(String),
    Count,
    Flush,
}

impl Request {
    pub fn parse(line: &str) -> Result<Self, String> {
        let line = line.trim_end_matches(['\r', '\n']);
        let (verb, rest) = match line.split_once(' ') {
            Some((verb, rest)) => (verb, rest.trim_start()),
            None => (line, ""),
        };

        match verb.to_ascii_uppercase().as_str() {
            "PING" => no_args("PING", rest).map(|_| Request::Ping),
            "COUNT" => no_args("COUNT", rest).map(|_| Request::Count),
            "FLUSH" => no_args("FLUSH", rest).map(|_| Request::Flush),
            "GET" => single_key("GET", rest).map(Request::Get),
            "DEL" => single_key("DEL", rest).map(Request::Del),
            "SET" => match rest.split_once(' ') {
                Some((key, value)) if !key.is_empty() => {
                    Ok(Request::Set(key.to_string(), value.to_string()))
                }
                _ => Err("SET expects a key and a value".to_string()),
            },
            "" => Err("empty request".to_string()),
            other => Err(format!("unknown command '{}'", other)),
        }
    }

    /// Requests that change the store. Init scripts may only contain these.
    pub fn is_write(&self) -> bool {
        matches!(self, Request::Set(..) | Request::Del(_) | Request::Flush)
    }
}

fn no_args(verb: &str, rest: &str) -> Result<(), String> {
    if rest.is_empty() {
        Ok(())
    } else {
        Err(format!("{} takes no arguments", verb))
    }
}

fn single_key(verb: &str, rest: &str) -> Result<String, String> {
    if rest.is_empty() || rest.contains(' ') {
        Err(format!("{} expects exactly one key", verb))
    } else {
        Ok(rest.to_string())
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Request::Ping => f.write_str("PING"),
            Request::Get(key) => write!(f, "GET {}", key),
            Request::Set(key, value) => write!(f, "SET {} {}", key, value),
            Request::Del(key) => write!(f, "DEL {}", key),
            Request::Count => f.write_str("COUNT"),
            Request::Flush => f.write_str("FLUSH"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Pong,
    Ok,
    Value(String),
    Nil,
    Int(u64),
    Err(String),
}

impl Response {
    pub fn parse(line: &str) -> Result<Self, String> {
        let line = line.trim_end_matches(['\r', '\n']);
        let (word, rest) = line.split_once(' ').unwrap_or((line, ""));
        match word {
            "PONG" => Ok(Response::Pong),
            "OK" => Ok(Response::Ok),
            "NIL" => Ok(Response::Nil),
            "VALUE" => Ok(Response::Value(rest.to_string())),
            "INT" => rest
                .parse()
                .map(Response::Int)
                .map_err(|_| format!("malformed integer reply '{}'", line)),
            "ERR" => Ok(Response::Err(rest.to_string())),
            _ => Err(format!("unexpected reply '{}'", line)),
        }
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Response::Pong => f.write_str("PONG"),
            Response::Ok => f.write_str("OK"),
            Response::Value(v) => write!(f, "VALUE {}", v),
            Response::Nil => f.write_str("NIL"),
            Response::Int(n) => write!(f, "INT {}", n),
            Response::Err(msg) => write!(f, "ERR {}", msg),
        }
    }
}
