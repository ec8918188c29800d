use std::sync::Arc;

use crate::http::Request;
use crate::types::agent::{
	HostnameMatch, Listener, PathMatch, Route, RouteMatch,
};

/// Select the best route for a request on the given listener.
///
/// Hostname filtering happens first (exact, then wildcard suffixes, then the
/// catch-all); within each hostname bucket routes are pre-sorted by match
/// precedence, so the first fully matching rule wins.
pub fn select_best_route(
	listener: &Listener,
	host: &str,
	req: &Request,
) -> Option<(Arc<Route>, PathMatch)> {
	for hm in HostnameMatch::all_matches(host) {
		for (route, m) in listener.routes.get_hostname(&hm) {
			if matches(m, req) {
				return Some((route, m.path.clone()));
			}
		}
	}
	None
}

fn matches(m: &RouteMatch, req: &Request) -> bool {
	path_matches(&m.path, req.uri().path())
		&& m
			.method
			.as_ref()
			.map(|want| req.method().as_str() == want.as_str())
			.unwrap_or(true)
		&& m.headers.iter().all(|h| {
			req.headers()
				.get(h.name.as_str())
				.and_then(|v| v.to_str().ok())
				.map(|v| h.value.matches(v))
				.unwrap_or(false)
		})
		&& m.query.iter().all(|q| {
			query_value(req, &q.name)
				.map(|v| q.value.matches(&v))
				.unwrap_or(false)
		})
}

fn path_matches(m: &PathMatch, path: &str) -> bool {
	match m {
		PathMatch::Exact(want) => path == want.as_str(),
		PathMatch::PathPrefix(prefix) => {
			let prefix = prefix.as_str();
			if prefix == "/" {
				return true;
			}
			// "/a" matches "/a", "/a/", "/a/b"; never "/ab".
			path == prefix || path.strip_prefix(prefix).is_some_and(|r| r.starts_with('/'))
		},
		PathMatch::Regex(re, _) => re.is_match(path),
	}
}

fn query_value(req: &Request, name: &str) -> Option<String> {
	let query = req.uri().query()?;
	for pair in query.split('&') {
		let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
		if k == name {
			return Some(v.to_string());
		}
	}
	None
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::http::Body;
	use crate::types::agent::{ListenerProtocol, RouteSet, ValueMatch};

	fn request(path: &str) -> Request {
		::http::Request::builder()
			.uri(format!("http://example.com{path}"))
			.body(Body::empty())
			.unwrap()
	}

	#[test]
	fn exact_path_boundaries() {
		let m = PathMatch::Exact("/a".into());
		assert!(path_matches(&m, "/a"));
		assert!(!path_matches(&m, "/a/"));
		assert!(!path_matches(&m, "/ab"));
	}

	#[test]
	fn prefix_path_boundaries() {
		let m = PathMatch::PathPrefix("/a".into());
		assert!(path_matches(&m, "/a"));
		assert!(path_matches(&m, "/a/"));
		assert!(path_matches(&m, "/a/b"));
		assert!(!path_matches(&m, "/ab"));
	}

	#[test]
	fn root_prefix_matches_everything() {
		let m = PathMatch::PathPrefix("/".into());
		assert!(path_matches(&m, "/"));
		assert!(path_matches(&m, "/anything"));
	}

	fn route(key: &str, hostnames: Vec<&str>, path: PathMatch) -> Route {
		Route {
			key: key.into(),
			route_name: key.into(),
			rule_name: None,
			hostnames: hostnames.into_iter().map(|h| h.into()).collect(),
			matches: vec![RouteMatch {
				path,
				method: None,
				headers: vec![],
				query: vec![],
			}],
			backends: vec![],
			inline_policies: vec![],
		}
	}

	fn listener(routes: Vec<Route>) -> Listener {
		Listener {
			key: "l".into(),
			name: "l".into(),
			gateway_name: "gw".into(),
			hostname: "".into(),
			protocol: ListenerProtocol::HTTP,
			routes: RouteSet::from_list(routes),
			tcp_routes: vec![],
		}
	}

	#[test]
	fn hostname_filtering() {
		let l = listener(vec![
			route("wild", vec!["*.example.com"], PathMatch::PathPrefix("/".into())),
			route("exact", vec!["a.example.com"], PathMatch::PathPrefix("/".into())),
		]);
		let (selected, _) = select_best_route(&l, "a.example.com", &request("/")).unwrap();
		assert_eq!(selected.key, "exact");
		let (selected, _) = select_best_route(&l, "b.example.com", &request("/")).unwrap();
		assert_eq!(selected.key, "wild");
		assert!(select_best_route(&l, "example.com", &request("/")).is_none());
	}

	#[test]
	fn most_specific_match_wins() {
		let l = listener(vec![
			route("prefix", vec![], PathMatch::PathPrefix("/api".into())),
			route("exact", vec![], PathMatch::Exact("/api/users".into())),
		]);
		let (selected, _) = select_best_route(&l, "any.host", &request("/api/users")).unwrap();
		assert_eq!(selected.key, "exact");
		let (selected, _) = select_best_route(&l, "any.host", &request("/api/other")).unwrap();
		assert_eq!(selected.key, "prefix");
	}

	#[test]
	fn header_and_query_constraints() {
		let mut r = route("hdr", vec![], PathMatch::PathPrefix("/".into()));
		r.matches[0].headers = vec![crate::types::agent::HeaderMatch {
			name: "x-env".into(),
			value: ValueMatch::Exact("prod".into()),
		}];
		r.matches[0].query = vec![crate::types::agent::QueryMatch {
			name: "v".into(),
			value: ValueMatch::Exact("2".into()),
		}];
		let l = listener(vec![r]);

		let matching = ::http::Request::builder()
			.uri("http://example.com/?v=2")
			.header("x-env", "prod")
			.body(Body::empty())
			.unwrap();
		assert!(select_best_route(&l, "example.com", &matching).is_some());

		let wrong_query = ::http::Request::builder()
			.uri("http://example.com/?v=3")
			.header("x-env", "prod")
			.body(Body::empty())
			.unwrap();
		assert!(select_best_route(&l, "example.com", &wrong_query).is_none());
	}
}
