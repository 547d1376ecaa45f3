//! Embedded admin console
//!
//! A single static page that lists, adds and deletes tenant routes through the JSON API under
//! `/admin/tenants`. An optional bearer token is kept in `localStorage`.

pub const ADMIN_CONSOLE_HTML: &str = r##"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="UTF-8">
    <meta name="viewport" content="width=device-width, initial-scale=1.0">
    <title>Tenant Router Admin</title>
    <style>
        * { margin: 0; padding: 0; box-sizing: border-box; }
        body {
            font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, sans-serif;
            background: #f4f5f7;
            color: #1f2937;
            padding: 24px;
        }
        .container { max-width: 1100px; margin: 0 auto; }
        h1 { font-size: 1.8rem; margin-bottom: 4px; }
        .subtitle { color: #6b7280; margin-bottom: 24px; }
        .card {
            background: #fff;
            border-radius: 8px;
            padding: 24px;
            margin-bottom: 24px;
            box-shadow: 0 1px 3px rgba(0, 0, 0, 0.1);
        }
        .card h2 { font-size: 1.2rem; margin-bottom: 16px; }
        .grid { display: grid; grid-template-columns: repeat(auto-fit, minmax(220px, 1fr)); gap: 12px; }
        label { display: block; font-weight: 600; font-size: 0.85rem; margin-bottom: 4px; }
        input {
            width: 100%;
            padding: 8px 10px;
            border: 1px solid #d1d5db;
            border-radius: 6px;
            font-size: 0.95rem;
        }
        button {
            padding: 8px 18px;
            border: none;
            border-radius: 6px;
            font-weight: 600;
            cursor: pointer;
        }
        .btn-primary { background: #2563eb; color: #fff; margin-top: 16px; }
        .btn-secondary { background: #e5e7eb; color: #1f2937; }
        .btn-danger { background: #dc2626; color: #fff; padding: 6px 12px; font-size: 0.85rem; }
        table { width: 100%; border-collapse: collapse; }
        th, td { text-align: left; padding: 10px 8px; border-bottom: 1px solid #e5e7eb; font-size: 0.9rem; }
        th { color: #6b7280; font-weight: 600; }
        code { background: #f3f4f6; padding: 2px 6px; border-radius: 4px; }
        .toolbar { display: flex; gap: 8px; align-items: flex-end; }
        .toolbar > div { flex: 1; }
        #message { padding: 10px 14px; border-radius: 6px; margin-bottom: 16px; display: none; }
        #message.ok { display: block; background: #dcfce7; color: #166534; }
        #message.error { display: block; background: #fee2e2; color: #991b1b; }
        .empty { color: #6b7280; text-align: center; padding: 24px; }
    </style>
</head>
<body>
<div class="container">
    <h1>Tenant Router</h1>
    <p class="subtitle">Domain to tenant routing table</p>

    <div id="message"></div>

    <div class="card">
        <div class="toolbar">
            <div>
                <label for="token">Admin token</label>
                <input id="token" type="password" placeholder="Leave empty when auth is disabled">
            </div>
            <button class="btn-secondary" onclick="saveToken()">Save</button>
            <button class="btn-secondary" onclick="clearCache()">Clear cache</button>
        </div>
    </div>

    <div class="card">
        <h2>Add or replace tenant</h2>
        <form id="tenant-form">
            <div class="grid">
                <div>
                    <label for="domain">Domain</label>
                    <input id="domain" placeholder="tenant1.example.com or *.example.com" required>
                </div>
                <div>
                    <label for="tenant_id">Tenant ID</label>
                    <input id="tenant_id" placeholder="tenant-123" required>
                </div>
                <div>
                    <label for="project_route">Project route</label>
                    <input id="project_route" placeholder="/projects/backend">
                </div>
                <div>
                    <label for="project_port">Project port</label>
                    <input id="project_port" type="number" min="1" max="65535" placeholder="optional">
                </div>
                <div>
                    <label for="backend_domain">Backend domain</label>
                    <input id="backend_domain" placeholder="optional, e.g. admin.localhost">
                </div>
            </div>
            <button class="btn-primary" type="submit">Save tenant</button>
        </form>
    </div>

    <div class="card">
        <h2>Tenants <span id="count"></span></h2>
        <div id="tenants"><p class="empty">Loading...</p></div>
    </div>
</div>

<script>
const API_BASE = '/admin/tenants';

function token() {
    return localStorage.getItem('tenant_router_token') || '';
}

function saveToken() {
    localStorage.setItem('tenant_router_token', document.getElementById('token').value.trim());
    loadTenants();
}

function headers(extra) {
    const h = Object.assign({}, extra || {});
    if (token()) {
        h['Authorization'] = 'Bearer ' + token();
    }
    return h;
}

function showMessage(text, kind) {
    const el = document.getElementById('message');
    el.textContent = text;
    el.className = kind;
    setTimeout(() => { el.className = ''; }, 4000);
}

function escapeHtml(value) {
    const div = document.createElement('div');
    div.textContent = value == null ? '' : String(value);
    return div.innerHTML;
}

async function request(method, path, body) {
    const options = { method, headers: headers(body ? { 'Content-Type': 'application/json' } : {}) };
    if (body) {
        options.body = JSON.stringify(body);
    }
    const response = await fetch(path, options);
    const data = await response.json().catch(() => ({}));
    if (!response.ok) {
        throw new Error(data.error || ('HTTP ' + response.status));
    }
    return data;
}

async function loadTenants() {
    const container = document.getElementById('tenants');
    try {
        const data = await request('GET', API_BASE);
        document.getElementById('count').textContent = '(' + data.count + ')';
        if (!data.tenants.length) {
            container.innerHTML = '<p class="empty">No tenants configured</p>';
            return;
        }
        container.innerHTML = '<table><thead><tr>' +
            '<th>Domain</th><th>Tenant</th><th>Route</th><th>Port</th><th>Backend domain</th><th>Created</th><th></th>' +
            '</tr></thead><tbody>' +
            data.tenants.map(t => '<tr>' +
                '<td><code>' + escapeHtml(t.domain) + '</code></td>' +
                '<td>' + escapeHtml(t.tenant_id) + '</td>' +
                '<td><code>' + escapeHtml(t.project_route) + '</code></td>' +
                '<td>' + escapeHtml(t.project_port || '') + '</td>' +
                '<td>' + escapeHtml(t.backend_domain || '') + '</td>' +
                '<td>' + escapeHtml(t.created_at || '') + '</td>' +
                '<td><button class="btn-danger" data-domain="' + escapeHtml(t.domain) + '">Delete</button></td>' +
            '</tr>').join('') +
            '</tbody></table>';
        container.querySelectorAll('button[data-domain]').forEach(btn => {
            btn.addEventListener('click', () => deleteTenant(btn.dataset.domain));
        });
    } catch (err) {
        container.innerHTML = '<p class="empty">' + escapeHtml(err.message) + '</p>';
    }
}

async function deleteTenant(domain) {
    if (!confirm('Delete tenant route ' + domain + '?')) {
        return;
    }
    try {
        await request('DELETE', API_BASE + '/' + encodeURIComponent(domain));
        showMessage('Deleted ' + domain, 'ok');
        loadTenants();
    } catch (err) {
        showMessage(err.message, 'error');
    }
}

async function clearCache() {
    try {
        const data = await request('DELETE', '/admin/cache');
        showMessage('Cleared ' + data.cleared + ' cached hosts', 'ok');
    } catch (err) {
        showMessage(err.message, 'error');
    }
}

document.getElementById('tenant-form').addEventListener('submit', async (event) => {
    event.preventDefault();
    const body = {
        domain: document.getElementById('domain').value.trim(),
        tenant_id: document.getElementById('tenant_id').value.trim(),
    };
    const route = document.getElementById('project_route').value.trim();
    const port = document.getElementById('project_port').value.trim();
    const backend = document.getElementById('backend_domain').value.trim();
    if (route) body.project_route = route;
    if (port) body.project_port = parseInt(port, 10);
    if (backend) body.backend_domain = backend;

    try {
        await request('POST', API_BASE, body);
        showMessage('Saved ' + body.domain, 'ok');
        event.target.reset();
        loadTenants();
    } catch (err) {
        showMessage(err.message, 'error');
    }
});

document.getElementById('token').value = token();
loadTenants();
</script>
</body>
</html>
"##;
