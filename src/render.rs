use crate::model::{ClusterEntry, ClusterSnapshot, CombinedSnapshot, MachineState, PoolEntry, PoolSnapshot};

const NO_CLUSTER_DATA: &str = "No cluster manager data available.";

const GREEN: &str = "#4caf50";
const YELLOW: &str = "#ffeb3b";
const RED: &str = "#f44336";

/// Progress bar colour for a load percentage.
pub fn bar_color(percentage: f64) -> &'static str {
    if percentage < 50.0 {
        GREEN
    } else if percentage < 80.0 {
        YELLOW
    } else {
        RED
    }
}

pub fn escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

fn page(title: &str, style: &str, body: &str) -> String {
    format!(
        "<!DOCTYPE html>\n<html lang=\"en\">\n<head>\n<meta charset=\"utf-8\">\n<title>{}</title>\n<style>{}</style>\n</head>\n<body>\n{}\n</body>\n</html>\n",
        escape(title),
        style,
        body
    )
}

pub fn render_login(error: Option<&str>) -> String {
    let error_line = error
        .map(|e| format!("<p class=\"error\">{}</p>", escape(e)))
        .unwrap_or_default();
    let body = [
        "<form method=\"post\" action=\"/login\">".to_string(),
        "<h2>Login</h2>".to_string(),
        error_line,
        "<label for=\"domain\">Domain</label><input type=\"text\" id=\"domain\" name=\"domain\">"
            .to_string(),
        "<label for=\"username\">Username</label><input type=\"text\" id=\"username\" name=\"username\" required>"
            .to_string(),
        "<label for=\"password\">Password</label><input type=\"password\" id=\"password\" name=\"password\" required>"
            .to_string(),
        "<button type=\"submit\">Sign in</button>".to_string(),
        "</form>".to_string(),
    ]
    .join("\n");
    page("Login", LOGIN_STYLE, &body)
}

fn render_pool(pool: &PoolSnapshot) -> String {
    let badges = pool
        .state_counts
        .iter()
        .map(|(state, count)| {
            let class = if count > 0 { "state nonzero" } else { "state zero" };
            format!("<span class=\"{class}\">{state}: {count}</span>")
        })
        .collect::<Vec<_>>()
        .join("");
    format!(
        "<div class=\"pool\"><h3>{}</h3><div class=\"states\">{}</div></div>",
        escape(&pool.pool_name),
        badges
    )
}

fn render_bar(label: &str, used: f64, capacity: f64, unit: &str, percentage: f64) -> String {
    format!(
        "<p>{label}: {used:.2} / {capacity:.2} {unit} ({percentage:.2}%)</p>\
         <div class=\"progress-bar-container\"><div class=\"progress-bar\" style=\"width:{width:.2}%; background-color:{color};\"></div></div>",
        width = percentage.clamp(0.0, 100.0),
        color = bar_color(percentage)
    )
}

fn render_cluster(cluster: &ClusterSnapshot) -> String {
    let rows = cluster
        .hosts
        .iter()
        .map(|h| {
            format!(
                "<tr><td>{}</td><td>{:.2}</td><td>{:.2}</td><td>{:.2}</td><td>{:.2}</td><td>{:.2}</td><td>{:.2}</td></tr>",
                escape(&h.name),
                h.used_memory_gb,
                h.total_memory_gb,
                h.free_memory_gb,
                h.cpu_usage_ghz,
                h.cpu_capacity_ghz,
                h.cpu_free_ghz
            )
        })
        .collect::<Vec<_>>()
        .join("");

    let mut out = vec![
        format!(
            "<div class=\"cluster\"><h3>{} ({} / {})</h3>",
            escape(&cluster.cluster_name),
            escape(&cluster.vcenter_name),
            escape(&cluster.vcenter_fqdn)
        ),
        render_bar(
            "Memory",
            cluster.total_used_gb,
            cluster.total_capacity_gb,
            "GB",
            cluster.memory_load_percentage,
        ),
        render_bar(
            "CPU",
            cluster.total_cpu_usage_ghz,
            cluster.total_cpu_capacity_ghz,
            "GHz",
            cluster.cpu_load_percentage,
        ),
    ];
    if !cluster.unreadable_hosts.is_empty() {
        let names = cluster
            .unreadable_hosts
            .iter()
            .map(|h| escape(h))
            .collect::<Vec<_>>()
            .join(", ");
        out.push(format!("<p class=\"error\">Hosts not read: {names}</p>"));
    }
    out.push(format!(
        "<details><summary>Hosts ({})</summary><table><tr><th>Host</th><th>Used GB</th><th>Total GB</th><th>Free GB</th><th>CPU GHz</th><th>Capacity GHz</th><th>Free GHz</th></tr>{}</table></details></div>",
        cluster.hosts.len(),
        rows
    ));
    out.join("\n")
}

/// Inner dashboard markup. The page script rebuilds the same structure from `/get_data`.
pub fn render_content(snapshot: &CombinedSnapshot) -> String {
    let mut out = Vec::new();

    for (url, entries) in &snapshot.pools_by_broker {
        out.push(format!(
            "<section class=\"server\"><h2>Desktop pools: {}</h2>",
            escape(url)
        ));
        if entries.is_empty() {
            out.push("<p>No pools.</p>".to_string());
        }
        for entry in entries {
            out.push(match entry {
                PoolEntry::Pool(pool) => render_pool(pool),
                PoolEntry::Error { error } => format!("<p class=\"error\">{}</p>", escape(error)),
            });
        }
        out.push("</section>".to_string());
    }

    if snapshot.clusters_by_backend.is_empty() {
        out.push(format!("<section class=\"vcenter\"><p>{NO_CLUSTER_DATA}</p></section>"));
    }
    for (id, entry) in &snapshot.clusters_by_backend {
        out.push(format!(
            "<section class=\"vcenter\"><h2>Cluster manager: {}</h2>",
            escape(id)
        ));
        out.push(match entry {
            ClusterEntry::Snapshot(cluster) => render_cluster(cluster),
            ClusterEntry::Unavailable { error } => {
                format!("<p class=\"error\">{}</p>", escape(error))
            }
            ClusterEntry::NotFound {} => "<p class=\"error\">Cluster not found.</p>".to_string(),
        });
        out.push("</section>".to_string());
    }

    out.push(format!(
        "<p class=\"fetch-time\">Last updated: {}</p>",
        escape(&snapshot.fetch_time())
    ));
    out.join("\n")
}

pub fn render_dashboard(snapshot: &CombinedSnapshot) -> String {
    let states = MachineState::ALL
        .iter()
        .map(|s| format!("\"{}\"", s.as_str()))
        .collect::<Vec<_>>()
        .join(",");
    let body = [
        "<h1>Infrastructure Dashboard</h1>".to_string(),
        "<div class=\"controls\"><label for=\"refresh\">Auto-refresh</label>\
         <select id=\"refresh\"><option value=\"0\">Off</option><option value=\"30\">30 s</option>\
         <option value=\"60\">60 s</option><option value=\"300\">5 min</option></select></div>"
            .to_string(),
        format!("<div id=\"content\">{}</div>", render_content(snapshot)),
        format!("<script>const STATES = [{states}];\n{DASHBOARD_SCRIPT}</script>"),
    ]
    .join("\n");
    page("Infrastructure Dashboard", DASHBOARD_STYLE, &body)
}

const LOGIN_STYLE: &str = "
body { font-family: Arial, sans-serif; display: flex; justify-content: center; margin-top: 80px; }
form { background-color: #f0f0f0; padding: 20px; border-radius: 5px; width: 300px; }
label, input, button { display: block; width: 100%; margin-bottom: 10px; box-sizing: border-box; }
.error { color: red; }
";

const DASHBOARD_STYLE: &str = "
body { font-family: Arial, sans-serif; background-color: #f0f0f0; color: #333; margin: 20px; }
section { background-color: #fff; border-radius: 5px; padding: 10px 20px; margin-bottom: 20px; }
.pool { border-bottom: 1px solid #eee; padding: 5px 0; }
.state { display: inline-block; padding: 3px 8px; margin: 2px; border-radius: 3px; font-size: 0.9em; }
.state.zero { background-color: #f5f5f5; color: #999; }
.state.nonzero { background-color: #ccffcc; color: #006600; }
.error { color: #ff0000; }
.progress-bar-container { width: 100%; background-color: #e0e0e0; border-radius: 5px; height: 20px; }
.progress-bar { height: 100%; border-radius: 5px; background-color: #4caf50; }
table { border-collapse: collapse; width: 100%; }
th, td { border: 1px solid #ddd; padding: 4px 8px; text-align: right; }
th:first-child, td:first-child { text-align: left; }
.fetch-time { color: #555; font-size: 0.9em; }
";

const DASHBOARD_SCRIPT: &str = r#"
let timer = null;
function esc(s) {
  return String(s).replace(/[&<>"']/g, c => ({'&':'&amp;','<':'&lt;','>':'&gt;','"':'&quot;',"'":'&#39;'}[c]));
}
function barColor(p) { return p < 50 ? '#4caf50' : (p < 80 ? '#ffeb3b' : '#f44336'); }
function bar(label, used, cap, unit, p) {
  const w = Math.min(Math.max(p, 0), 100);
  return `<p>${label}: ${used.toFixed(2)} / ${cap.toFixed(2)} ${unit} (${p.toFixed(2)}%)</p>` +
    `<div class="progress-bar-container"><div class="progress-bar" style="width:${w.toFixed(2)}%; background-color:${barColor(p)};"></div></div>`;
}
function renderPool(p) {
  const badges = STATES.map(s => {
    const n = (p.state_counts || {})[s] || 0;
    return `<span class="state ${n > 0 ? 'nonzero' : 'zero'}">${s}: ${n}</span>`;
  }).join('');
  return `<div class="pool"><h3>${esc(p.pool_name)}</h3><div class="states">${badges}</div></div>`;
}
function renderCluster(c) {
  let html = `<div class="cluster"><h3>${esc(c.cluster_name)} (${esc(c.vcenter_name)} / ${esc(c.vcenter_fqdn)})</h3>`;
  html += bar('Memory', c.total_used_gb, c.total_capacity_gb, 'GB', c.memory_load_percentage);
  html += bar('CPU', c.total_cpu_usage_ghz, c.total_cpu_capacity_ghz, 'GHz', c.cpu_load_percentage);
  if (c.unreadable_hosts && c.unreadable_hosts.length) {
    html += `<p class="error">Hosts not read: ${c.unreadable_hosts.map(esc).join(', ')}</p>`;
  }
  const rows = c.hosts.map(h => `<tr><td>${esc(h.name)}</td><td>${h.used_memory_gb.toFixed(2)}</td><td>${h.total_memory_gb.toFixed(2)}</td>` +
    `<td>${h.free_memory_gb.toFixed(2)}</td><td>${h.cpu_usage_ghz.toFixed(2)}</td><td>${h.cpu_capacity_ghz.toFixed(2)}</td><td>${h.cpu_free_ghz.toFixed(2)}</td></tr>`).join('');
  html += `<details><summary>Hosts (${c.hosts.length})</summary><table><tr><th>Host</th><th>Used GB</th><th>Total GB</th><th>Free GB</th>` +
    `<th>CPU GHz</th><th>Capacity GHz</th><th>Free GHz</th></tr>${rows}</table></details></div>`;
  return html;
}
function render(data) {
  let html = '';
  for (const [url, entries] of Object.entries(data.server_data)) {
    html += `<section class="server"><h2>Desktop pools: ${esc(url)}</h2>`;
    if (!entries.length) html += '<p>No pools.</p>';
    for (const e of entries) {
      html += e.error !== undefined ? `<p class="error">${esc(e.error)}</p>` : renderPool(e);
    }
    html += '</section>';
  }
  if (!Object.keys(data.vcenter_data).length) {
    html += '<section class="vcenter"><p>No cluster manager data available.</p></section>';
  }
  for (const [id, c] of Object.entries(data.vcenter_data)) {
    html += `<section class="vcenter"><h2>Cluster manager: ${esc(id)}</h2>`;
    if (c.error !== undefined) html += `<p class="error">${esc(c.error)}</p>`;
    else if (c.hosts === undefined) html += '<p class="error">Cluster not found.</p>';
    else html += renderCluster(c);
    html += '</section>';
  }
  html += `<p class="fetch-time">Last updated: ${esc(data.fetch_time)}</p>`;
  document.getElementById('content').innerHTML = html;
}
function refreshData() {
  fetch('/get_data').then(r => {
    if (r.status === 401) { window.location.href = '/'; return null; }
    return r.json();
  }).then(d => { if (d) render(d); }).catch(e => console.error('refresh failed', e));
}
document.getElementById('refresh').addEventListener('change', e => {
  if (timer) { clearInterval(timer); timer = null; }
  const interval = parseInt(e.target.value, 10);
  if (interval > 0) timer = setInterval(refreshData, interval * 1000);
});
"#;
