// Copyright 2019-2026 Maravilla Labs, operated by SOLUTAS GmbH, Switzerland
// SPDX-License-Identifier: Apache-2.0
// SPDX-License-Identifier: MIT

//! End-to-end engine tests: full pipeline from source through lexing,
//! parsing and rendering, including inheritance, composition, escaping,
//! sandboxing and the compiled-template round trip.

use serde_json::json;

use crate::cache::FileSystemCache;
use crate::error::WickerError;
use crate::loader::{FileSystemLoader, MemoryLoader};
use crate::sandbox::SandboxPolicy;
use crate::value::Value;
use crate::Engine;

// Helper to build an engine preloaded with string templates.
fn engine_with(templates: &[(&str, &str)]) -> Engine {
    let engine = Engine::new();
    for (name, source) in templates {
        engine.add_template(name, source).unwrap();
    }
    engine
}

// Helper to render a single template against JSON data.
fn render(source: &str, data: serde_json::Value) -> crate::Result<String> {
    let engine = engine_with(&[("test.html", source)]);
    engine.render("test.html", data)
}

fn render_ok(source: &str, data: serde_json::Value) -> String {
    render(source, data).unwrap()
}

mod basics {
    use super::*;

    #[test]
    fn test_hello_world() {
        assert_eq!(
            render_ok("Hello {{ name }}!", json!({"name": "World"})),
            "Hello World!"
        );
    }

    #[test]
    fn test_empty_template() {
        assert_eq!(render_ok("", json!({})), "");
    }

    #[test]
    fn test_comment_only_template() {
        assert_eq!(render_ok("{# nothing to see #}", json!({})), "");
    }

    #[test]
    fn test_whitespace_control() {
        assert_eq!(
            render_ok("Hello   {{- name -}}   !", json!({"name": "X"})),
            "HelloX!"
        );
        assert_eq!(
            render_ok("a\n  {%- if true %}b{% endif -%}  \nc", json!({})),
            "abc"
        );
    }

    #[test]
    fn test_undefined_renders_empty_by_default() {
        assert_eq!(render_ok("[{{ missing }}]", json!({})), "[]");
        assert_eq!(render_ok("[{{ user.name }}]", json!({})), "[]");
    }

    #[test]
    fn test_strict_mode_fails_on_undefined() {
        let mut engine = Engine::new();
        engine.set_strict_variables(true);
        engine.add_template("t", "{{ missing }}").unwrap();
        let err = engine.render("t", json!({})).unwrap_err();
        assert!(err.is_undefined(), "expected undefined error, got {:?}", err);
    }

    #[test]
    fn test_default_filter_recovers_undefined() {
        let mut engine = Engine::new();
        engine.set_strict_variables(true);
        engine
            .add_template("t", "{{ missing|default('fallback') }}")
            .unwrap();
        assert_eq!(engine.render("t", json!({})).unwrap(), "fallback");
    }

    #[test]
    fn test_globals() {
        let engine = engine_with(&[("t", "{{ site }}/{{ page }}")]);
        engine.add_global("site", Value::string("wicker.dev"));
        assert_eq!(
            engine.render("t", json!({"page": "docs"})).unwrap(),
            "wicker.dev/docs"
        );
    }
}

mod expressions {
    use super::*;

    #[test]
    fn test_arithmetic() {
        assert_eq!(render_ok("{{ 1 + 2 * 3 }}", json!({})), "7");
        assert_eq!(render_ok("{{ 7 // 2 }} {{ 7 % 2 }}", json!({})), "3 1");
        // Floor division rounds towards negative infinity on both paths.
        assert_eq!(render_ok("{{ 7 // -2 }} {{ 7 // -2.0 }}", json!({})), "-4 -4");
        assert_eq!(render_ok("{{ 3 / 2 }}", json!({})), "1.5");
        assert_eq!(render_ok("{{ 2 ** 8 }}", json!({})), "256");
        assert_eq!(render_ok("{{ -5|abs }}", json!({})), "5");
    }

    #[test]
    fn test_division_by_zero_fails() {
        let err = render("{{ 1 / 0 }}", json!({})).unwrap_err();
        match err {
            WickerError::RenderError { name, line, .. } => {
                assert_eq!(name, "test.html");
                assert_eq!(line, 1);
            }
            other => panic!("expected render error, got {:?}", other),
        }
    }

    #[test]
    fn test_int_overflow_promotes_to_float() {
        // Wrapping would flip the sign; promotion keeps the value positive.
        let out = render_ok(
            "{{ big + 1 > 0 ? 'promoted' : 'wrapped' }}",
            json!({"big": i64::MAX}),
        );
        assert_eq!(out, "promoted");
    }

    #[test]
    fn test_concat_coercion() {
        assert_eq!(
            render_ok("{{ 'v' ~ 2 ~ null ~ true }}", json!({})),
            "v21"
        );
    }

    #[test]
    fn test_ternary_and_elvis() {
        assert_eq!(
            render_ok("{{ n > 0 ? 'pos' : 'neg' }}", json!({"n": 3})),
            "pos"
        );
        assert_eq!(render_ok("{{ name ?: 'anon' }}", json!({})), "anon");
        assert_eq!(
            render_ok("{{ name ?: 'anon' }}", json!({"name": "Ada"})),
            "Ada"
        );
    }

    #[test]
    fn test_short_circuit() {
        // The second operand would fail; it must never be evaluated.
        assert_eq!(
            render_ok("{{ false and 1/0 }}|{{ true or 1/0 }}", json!({})),
            "|1"
        );
    }

    #[test]
    fn test_containment_and_ranges() {
        assert_eq!(render_ok("{% if 2 in [1, 2] %}y{% endif %}", json!({})), "y");
        assert_eq!(
            render_ok("{% if 'x' not in 'abc' %}n{% endif %}", json!({})),
            "n"
        );
        assert_eq!(render_ok("{{ (1..4)|join(',') }}", json!({})), "1,2,3,4");
    }

    #[test]
    fn test_string_operators() {
        assert_eq!(
            render_ok("{% if 'hello' matches 'l+o' %}m{% endif %}", json!({})),
            "m"
        );
        assert_eq!(
            render_ok(
                "{% if s starts with 'ab' and s ends with 'yz' %}ok{% endif %}",
                json!({"s": "ab..yz"})
            ),
            "ok"
        );
    }

    #[test]
    fn test_attribute_and_index_access() {
        let data = json!({"user": {"name": "Ada"}, "items": [10, 20, 30]});
        assert_eq!(render_ok("{{ user.name }}", data.clone()), "Ada");
        assert_eq!(render_ok("{{ items[1] }}", data.clone()), "20");
        assert_eq!(render_ok("{{ items[-1] }}", data.clone()), "30");
        // Out of bounds yields null, which renders empty.
        assert_eq!(render_ok("[{{ items[9] }}]", data.clone()), "[]");
        assert_eq!(
            render_ok("{{ items.first }}-{{ items.last }}-{{ items.length }}", data),
            "10-30-3"
        );
    }

    #[test]
    fn test_tests() {
        assert_eq!(
            render_ok(
                "{{ 4 is even ? 'e' : 'o' }}{{ 3 is odd ? 'o' : 'e' }}",
                json!({})
            ),
            "eo"
        );
        assert_eq!(
            render_ok("{% if n is divisible by(3) %}fizz{% endif %}", json!({"n": 9})),
            "fizz"
        );
        assert_eq!(
            render_ok("{% if x is defined %}1{% else %}0{% endif %}", json!({})),
            "0"
        );
        assert_eq!(
            render_ok(
                "{% if x.y is not defined %}missing{% endif %}",
                json!({"x": {}})
            ),
            "missing"
        );
    }

    #[test]
    fn test_number_string_comparison() {
        assert_eq!(render_ok("{% if 10 > '9' %}y{% endif %}", json!({})), "y");
    }
}

mod control_flow {
    use super::*;

    #[test]
    fn test_if_elseif_else() {
        let source = "{% if n > 0 %}pos{% elseif n < 0 %}neg{% else %}zero{% endif %}";
        assert_eq!(render_ok(source, json!({"n": -3})), "neg");
        assert_eq!(render_ok(source, json!({"n": 5})), "pos");
        assert_eq!(render_ok(source, json!({"n": 0})), "zero");
    }

    #[test]
    fn test_for_with_loop_meta() {
        let source =
            "{% for i in 1..3 %}{{ loop.index }}:{{ i }}{% if not loop.last %},{% endif %}{% endfor %}";
        assert_eq!(render_ok(source, json!({})), "1:1,2:2,3:3");
    }

    #[test]
    fn test_loop_counters_invariant() {
        // index + revindex0 == length, first == (index == 1), last == (index == length)
        let source = "{% for i in [7, 8, 9] %}\
{{ loop.index + loop.revindex0 == loop.length ? 'a' : 'X' }}\
{{ loop.first == (loop.index == 1) ? 'b' : 'X' }}\
{{ loop.last == (loop.index == loop.length) ? 'c' : 'X' }};{% endfor %}";
        assert_eq!(render_ok(source, json!({})), "abc;abc;abc;");
    }

    #[test]
    fn test_for_over_map_two_targets() {
        let source = "{% for k, v in prices %}{{ k }}={{ v }};{% endfor %}";
        assert_eq!(
            render_ok(source, json!({"prices": {"tea": 3, "coffee": 4}})),
            "tea=3;coffee=4;"
        );
    }

    #[test]
    fn test_for_else_on_empty_and_null() {
        let source = "{% for x in items %}{{ x }}{% else %}none{% endfor %}";
        assert_eq!(render_ok(source, json!({"items": []})), "none");
        assert_eq!(render_ok(source, json!({"items": null})), "none");
        assert_eq!(render_ok(source, json!({})), "none");
    }

    #[test]
    fn test_for_condition_filters_before_counting() {
        let source =
            "{% for i in [1, 2, 3, 4] if i is even %}{{ i }}/{{ loop.length }};{% endfor %}";
        assert_eq!(render_ok(source, json!({})), "2/2;4/2;");
    }

    #[test]
    fn test_nested_loop_parent() {
        let source = "{% for a in [1, 2] %}{% for b in [1] %}\
{{ loop.parent.index }}.{{ loop.index }};{% endfor %}{% endfor %}";
        assert_eq!(render_ok(source, json!({})), "1.1;2.1;");
    }

    #[test]
    fn test_set_forms() {
        assert_eq!(
            render_ok("{% set a, b = 1, 'x' %}{{ a }}{{ b }}", json!({})),
            "1x"
        );
        assert_eq!(
            render_ok("{% set n = 1 %}{% set n += 5 %}{{ n }}", json!({})),
            "6"
        );
    }

    #[test]
    fn test_set_capture_is_safe() {
        let source = "{% set x %}<b>{{ v }}</b>{% endset %}{{ x }}";
        assert_eq!(
            render_ok(source, json!({"v": "<i>"})),
            "<b>&lt;i&gt;</b>"
        );
    }

    #[test]
    fn test_scope_shadowing_in_loop() {
        // The loop target shadows the outer variable and the frame pops after.
        let source = "{% set i = 'outer' %}{% for i in [1] %}{{ i }}{% endfor %}{{ i }}";
        assert_eq!(render_ok(source, json!({})), "1outer");
    }

    #[test]
    fn test_do_discards() {
        assert_eq!(render_ok("{% do 1 + 1 %}done", json!({})), "done");
    }

    #[test]
    fn test_apply() {
        assert_eq!(
            render_ok("{% apply upper %}abc{% endapply %}", json!({})),
            "ABC"
        );
        // Literal body text is not escaped, and the chain result is
        // written through as-is.
        assert_eq!(
            render_ok(
                "{% apply upper|trim %}  a<b  {% endapply %}",
                json!({})
            ),
            "A<B"
        );
    }
}

mod escaping {
    use super::*;

    #[test]
    fn test_autoescape_default_and_raw() {
        assert_eq!(
            render_ok("{{ \"<b>x</b>\" }} / {{ \"<b>x</b>\"|raw }}", json!({})),
            "&lt;b&gt;x&lt;/b&gt; / <b>x</b>"
        );
    }

    #[test]
    fn test_escaped_output_has_no_raw_specials() {
        let out = render_ok("{{ v }}", json!({"v": "<a href=\"x\">&'"}));
        assert_eq!(out, "&lt;a href=&quot;x&quot;&gt;&amp;&#39;");
    }

    #[test]
    fn test_raw_escape_round_trip() {
        // For non-safe x: x|raw|escape == x|escape; for safe x, escape is a no-op.
        assert_eq!(
            render_ok("{{ v|raw|escape }}", json!({"v": "<b>"})),
            "<b>"
        );
        assert_eq!(
            render_ok("{{ v|escape|escape }}", json!({"v": "<b>"})),
            "&lt;b&gt;"
        );
    }

    #[test]
    fn test_autoescape_blocks() {
        assert_eq!(
            render_ok(
                "{% autoescape false %}{{ '<b>' }}{% endautoescape %}",
                json!({})
            ),
            "<b>"
        );
        assert_eq!(
            render_ok(
                "{% autoescape 'js' %}{{ '<' }}{% endautoescape %}",
                json!({})
            ),
            "\\u003C"
        );
        // The stack pops back to html afterwards.
        assert_eq!(
            render_ok(
                "{% autoescape false %}{% endautoescape %}{{ '<' }}",
                json!({})
            ),
            "&lt;"
        );
    }

    #[test]
    fn test_autoescape_disabled_engine() {
        let mut engine = Engine::new();
        engine.set_autoescape(false);
        engine.add_template("t", "{{ v }}").unwrap();
        assert_eq!(
            engine.render("t", json!({"v": "<b>"})).unwrap(),
            "<b>"
        );
    }
}

mod inheritance {
    use super::*;

    #[test]
    fn test_extends_with_parent_call() {
        let engine = engine_with(&[
            ("p", "A[{% block b %}P{% endblock %}]B"),
            ("c", "{% extends \"p\" %}{% block b %}C{{ parent() }}C{% endblock %}"),
        ]);
        assert_eq!(engine.render("c", json!({})).unwrap(), "A[CPC]B");
    }

    #[test]
    fn test_three_level_chain() {
        let engine = engine_with(&[
            ("a", "<{% block x %}a{% endblock %}>"),
            ("b", "{% extends 'a' %}{% block x %}b({{ parent() }}){% endblock %}"),
            ("c", "{% extends 'b' %}{% block x %}c({{ parent() }}){% endblock %}"),
        ]);
        assert_eq!(engine.render("c", json!({})).unwrap(), "<c(b(a))>");
    }

    #[test]
    fn test_parent_without_ancestor_is_empty() {
        let engine = engine_with(&[("t", "{% block b %}[{{ parent() }}]{% endblock %}")]);
        assert_eq!(engine.render("t", json!({})).unwrap(), "[]");
    }

    #[test]
    fn test_child_text_outside_blocks_is_discarded() {
        let engine = engine_with(&[
            ("base", "({% block b %}base{% endblock %})"),
            (
                "child",
                "  {% extends 'base' %}{% set greeting = 'hi' %}{% block b %}{{ greeting }}{% endblock %}",
            ),
        ]);
        assert_eq!(engine.render("child", json!({})).unwrap(), "(hi)");
    }

    #[test]
    fn test_inheritance_cycle_fails() {
        let engine = engine_with(&[
            ("a", "{% extends 'b' %}"),
            ("b", "{% extends 'a' %}"),
        ]);
        let err = engine.render("a", json!({})).unwrap_err();
        assert!(err.to_string().contains("cycle"), "got {}", err);
    }

    #[test]
    fn test_dynamic_parent_name() {
        let engine = engine_with(&[
            ("base-fancy", "fancy:{% block b %}{% endblock %}"),
            (
                "child",
                "{% extends 'base-' ~ theme %}{% block b %}x{% endblock %}",
            ),
        ]);
        assert_eq!(
            engine.render("child", json!({"theme": "fancy"})).unwrap(),
            "fancy:x"
        );
    }

    #[test]
    fn test_block_function() {
        let engine = engine_with(&[(
            "t",
            "{% block title %}Home{% endblock %} / {{ block('title') }}",
        )]);
        assert_eq!(engine.render("t", json!({})).unwrap(), "Home / Home");
    }
}

mod composition {
    use super::*;

    #[test]
    fn test_include_inherits_context() {
        let engine = engine_with(&[
            ("partial", "{{ a }}{{ b }}"),
            ("main", "{% include 'partial' with {b: 2} %}"),
        ]);
        assert_eq!(engine.render("main", json!({"a": 1})).unwrap(), "12");
    }

    #[test]
    fn test_include_only() {
        let engine = engine_with(&[
            ("partial", "[{{ a }}{{ b }}]"),
            ("main", "{% include 'partial' with {b: 2} only %}"),
        ]);
        assert_eq!(engine.render("main", json!({"a": 1})).unwrap(), "[2]");
    }

    #[test]
    fn test_include_ignore_missing() {
        let engine = engine_with(&[("main", "a{% include 'ghost' ignore missing %}b")]);
        assert_eq!(engine.render("main", json!({})).unwrap(), "ab");

        let engine = engine_with(&[("main", "{% include 'ghost' %}")]);
        assert!(engine.render("main", json!({})).is_err());
    }

    #[test]
    fn test_include_function() {
        let engine = engine_with(&[
            ("partial", "<{{ x }}>"),
            ("main", "{{ include('partial', {x: 1}) }}"),
        ]);
        assert_eq!(engine.render("main", json!({})).unwrap(), "<1>");
    }

    #[test]
    fn test_embed_overrides_blocks() {
        let engine = engine_with(&[
            ("card", "<div>{% block content %}default{% endblock %}</div>"),
            (
                "main",
                "{% embed 'card' %}{% block content %}custom {{ n }}{% endblock %}{% endembed %}",
            ),
        ]);
        assert_eq!(
            engine.render("main", json!({"n": 7})).unwrap(),
            "<div>custom 7</div>"
        );
    }

    #[test]
    fn test_embed_keeps_unoverridden_blocks() {
        let engine = engine_with(&[
            ("card", "{% block a %}A{% endblock %}{% block b %}B{% endblock %}"),
            (
                "main",
                "{% embed 'card' %}{% block b %}override{% endblock %}{% endembed %}",
            ),
        ]);
        assert_eq!(engine.render("main", json!({})).unwrap(), "Aoverride");
    }

    #[test]
    fn test_template_from_string() {
        let engine = engine_with(&[(
            "main",
            "{{ include(template_from_string('Hi {{ who }}'), {who: 'you'}) }}",
        )]);
        assert_eq!(engine.render("main", json!({})).unwrap(), "Hi you");
    }

    #[test]
    fn test_source_function() {
        let engine = engine_with(&[("raw.txt", "{{ x }}"), ("main", "{{ source('raw.txt') }}")]);
        // The raw source is printed escaped, not rendered.
        assert_eq!(
            engine.render("main", json!({"x": "ignored"})).unwrap(),
            "{{ x }}"
        );
    }
}

mod macros {
    use super::*;

    #[test]
    fn test_local_macro_with_defaults() {
        let source = "{% macro f(n, s=\", \") %}{{ n }}{{ s }}{% endmacro %}{{ f(\"a\") }}{{ f(\"b\",\"!\") }}";
        assert_eq!(render_ok(source, json!({})), "a, b!");
    }

    #[test]
    fn test_import_alias() {
        let engine = engine_with(&[
            (
                "forms",
                "{% macro input(name) %}<input name=\"{{ name }}\">{% endmacro %}",
            ),
            ("main", "{% import 'forms' as f %}{{ f.input('q') }}"),
        ]);
        assert_eq!(
            engine.render("main", json!({})).unwrap(),
            "<input name=\"q\">"
        );
    }

    #[test]
    fn test_from_import_with_alias() {
        let engine = engine_with(&[
            ("forms", "{% macro input(name) %}[{{ name }}]{% endmacro %}"),
            (
                "main",
                "{% from 'forms' import input as field %}{{ field('a') }}",
            ),
        ]);
        assert_eq!(engine.render("main", json!({})).unwrap(), "[a]");
    }

    #[test]
    fn test_from_import_missing_macro_fails() {
        let engine = engine_with(&[
            ("forms", "{% macro input(name) %}x{% endmacro %}"),
            ("main", "{% from 'forms' import ghost %}"),
        ]);
        let err = engine.render("main", json!({})).unwrap_err();
        assert!(err.to_string().contains("ghost"), "got {}", err);
    }

    #[test]
    fn test_import_self() {
        let source = "{% macro a() %}A{% endmacro %}{% import _self as me %}{{ me.a() }}";
        assert_eq!(render_ok(source, json!({})), "A");
    }

    #[test]
    fn test_macro_named_arguments() {
        let source =
            "{% macro pair(a, b='B') %}{{ a }}{{ b }}{% endmacro %}{{ pair(b='!', a='A') }}";
        assert_eq!(render_ok(source, json!({})), "A!");
    }

    #[test]
    fn test_macro_does_not_see_caller_scope() {
        let source =
            "{% set secret = 'leak' %}{% macro f() %}[{{ secret }}]{% endmacro %}{{ f() }}";
        assert_eq!(render_ok(source, json!({})), "[]");
    }

    #[test]
    fn test_macro_output_is_safe_but_arguments_escape() {
        let source = "{% macro wrap(v) %}<b>{{ v }}</b>{% endmacro %}{{ wrap('<i>') }}";
        assert_eq!(render_ok(source, json!({})), "<b>&lt;i&gt;</b>");
    }

    #[test]
    fn test_macro_recursion_is_bounded() {
        let source = "{% macro f() %}{{ f() }}{% endmacro %}{{ f() }}";
        let err = render(source, json!({})).unwrap_err();
        assert!(err.to_string().contains("depth"), "got {}", err);
    }
}

mod sandboxing {
    use super::*;

    #[test]
    fn test_sandbox_blocks_filters_not_in_policy() {
        let engine = engine_with(&[("t", "{% sandbox %}{{ v|upper }}{% endsandbox %}")]);
        engine.set_sandbox_policy(SandboxPolicy::new().allow_filter("lower"));
        let err = engine.render("t", json!({"v": "x"})).unwrap_err();
        match err {
            WickerError::SandboxError { entity, .. } => assert_eq!(entity, "upper"),
            other => panic!("expected sandbox error, got {:?}", other),
        }
    }

    #[test]
    fn test_sandbox_allows_what_policy_allows() {
        let engine = engine_with(&[("t", "{% sandbox %}{{ v|upper }}{% endsandbox %}")]);
        engine.set_sandbox_policy(SandboxPolicy::new().allow_filter("upper"));
        assert_eq!(engine.render("t", json!({"v": "x"})).unwrap(), "X");
    }

    #[test]
    fn test_sandbox_tag_deny_list() {
        let engine = engine_with(&[
            ("inner", "x"),
            ("t", "{% sandbox %}{% include 'inner' %}{% endsandbox %}"),
        ]);
        engine.set_sandbox_policy(SandboxPolicy::new().block_tag("include"));
        let err = engine.render("t", json!({})).unwrap_err();
        assert!(err.to_string().contains("include"), "got {}", err);
    }

    #[test]
    fn test_sandboxed_include_does_not_leak_to_parent() {
        let engine = engine_with(&[
            ("inner", "{{ v|upper }}"),
            ("t", "{% include 'inner' sandboxed %}|{{ v|upper }}"),
        ]);
        engine.set_sandbox_policy(SandboxPolicy::new());
        // The sandboxed child is blocked...
        let err = engine.render("t", json!({"v": "x"})).unwrap_err();
        assert!(matches!(
            err,
            WickerError::RenderError { .. } | WickerError::SandboxError { .. }
        ));
        // ...but without the sandboxed flag the same engine renders fine.
        engine.add_template("t2", "{% include 'inner' %}|{{ v|upper }}").unwrap();
        assert_eq!(engine.render("t2", json!({"v": "x"})).unwrap(), "X|X");
    }

    #[test]
    fn test_sandbox_flag_restored_after_block() {
        let engine = engine_with(&[("t", "{% sandbox %}a{% endsandbox %}{{ v|upper }}")]);
        engine.set_sandbox_policy(SandboxPolicy::new());
        assert_eq!(engine.render("t", json!({"v": "x"})).unwrap(), "aX");
    }
}

mod compiled {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_codec_round_trip_renders_identically() {
        let source = "{% for i in 1..n %}{{ i }}{% if not loop.last %},{% endif %}{% endfor %}";
        let engine = engine_with(&[("t", source)]);
        let data = json!({"n": 4});
        let direct = engine.render("t", data.clone()).unwrap();

        let bytes = engine.compile("t").unwrap();
        let other = Engine::new();
        let name = other.load_compiled(&bytes).unwrap();
        assert_eq!(name, "t");
        assert_eq!(other.render("t", data).unwrap(), direct);
    }

    #[test]
    fn test_compiled_inheritance_round_trip() {
        let engine = engine_with(&[
            ("p", "A[{% block b %}P{% endblock %}]B"),
            ("c", "{% extends \"p\" %}{% block b %}C{{ parent() }}C{% endblock %}"),
        ]);
        let other = Engine::new();
        other.load_compiled(&engine.compile("p").unwrap()).unwrap();
        other.load_compiled(&engine.compile("c").unwrap()).unwrap();
        assert_eq!(other.render("c", json!({})).unwrap(), "A[CPC]B");
    }

    #[test]
    fn test_filesystem_cache_round_trip() {
        let dir = TempDir::new().unwrap();
        let loader = MemoryLoader::new();
        loader.add_template("t", "{{ 2 + 2 }}");

        let engine = Engine::new();
        engine.add_loader(Box::new(loader.clone()));
        engine.set_compiled_cache(Box::new(
            FileSystemCache::new(dir.path(), 4).unwrap(),
        ));
        assert_eq!(engine.render("t", json!({})).unwrap(), "4");

        // A second engine over the same cache dir deserialises instead of
        // parsing.
        let engine2 = Engine::new();
        engine2.add_loader(Box::new(loader));
        engine2.set_compiled_cache(Box::new(
            FileSystemCache::new(dir.path(), 4).unwrap(),
        ));
        assert_eq!(engine2.render("t", json!({})).unwrap(), "4");
    }
}

mod loading {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_filesystem_loader_end_to_end() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("page.html"), "Hi {{ name }}").unwrap();

        let engine = Engine::new();
        engine.add_loader(Box::new(FileSystemLoader::new(dir.path())));
        assert_eq!(
            engine.render("page.html", json!({"name": "Bo"})).unwrap(),
            "Hi Bo"
        );
    }

    #[test]
    fn test_loader_chain_order() {
        let first = MemoryLoader::new();
        first.add_template("t", "first");
        let second = MemoryLoader::new();
        second.add_template("t", "second");

        let engine = Engine::new();
        engine.add_loader(Box::new(first));
        engine.add_loader(Box::new(second));
        assert_eq!(engine.render("t", json!({})).unwrap(), "first");
    }

    #[test]
    fn test_missing_template() {
        let engine = Engine::new();
        let err = engine.render("ghost", json!({})).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_parse_error_carries_location() {
        let engine = Engine::new();
        let err = engine.add_template("bad", "line one\n{{ 1 + }}").unwrap_err();
        match err {
            WickerError::ParseError { line, name, .. } => {
                assert_eq!(name, "bad");
                assert_eq!(line, 2);
            }
            other => panic!("expected parse error, got {:?}", other),
        }
    }
}

mod concurrency {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_concurrent_renders() {
        let engine = Arc::new(engine_with(&[(
            "t",
            "{% for i in 1..50 %}{{ i }},{% endfor %}",
        )]));
        let expected = engine.render("t", json!({})).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let engine = engine.clone();
                let expected = expected.clone();
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        assert_eq!(engine.render("t", json!({})).unwrap(), expected);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
    }
}

mod extension {
    use super::*;
    use crate::error::Result;
    use crate::value::Object;

    #[test]
    fn test_custom_filter_and_function() {
        let engine = engine_with(&[("t", "{{ v|shout }} {{ twice(3) }}")]);
        engine.add_filter("shout", |value, _args| {
            Ok(Value::string(format!("{}!", value.to_output_string()?)))
        });
        engine.add_function("twice", |args| {
            let n = args.first().and_then(|v| v.as_int()).unwrap_or(0);
            Ok(Value::Int(n * 2))
        });
        assert_eq!(engine.render("t", json!({"v": "hey"})).unwrap(), "hey! 6");
    }

    #[derive(Debug)]
    struct Account {
        owner: &'static str,
    }

    impl Object for Account {
        fn get_field(&self, name: &str) -> Option<Value> {
            match name {
                "owner" => Some(Value::string(self.owner)),
                _ => None,
            }
        }

        fn has_method(&self, name: &str) -> bool {
            name == "masked"
        }

        fn call_method(&self, name: &str, _args: &[Value]) -> Result<Value> {
            match name {
                "masked" => Ok(Value::string(format!("{}***", &self.owner[..1]))),
                other => Err(crate::WickerError::TypeError(format!(
                    "object has no method \"{}\"",
                    other
                ))),
            }
        }
    }

    #[test]
    fn test_host_object_fields_and_methods() {
        let engine = engine_with(&[("t", "{{ acct.owner }}/{{ acct.masked }}")]);
        engine.add_global("acct", Value::object(Account { owner: "ada" }));
        assert_eq!(engine.render("t", json!({})).unwrap(), "ada/a***");
    }

    #[test]
    fn test_sandbox_checks_object_attributes() {
        let engine = engine_with(&[("t", "{% sandbox %}{{ acct.owner }}{% endsandbox %}")]);
        engine.add_global("acct", Value::object(Account { owner: "ada" }));
        engine.set_sandbox_policy(SandboxPolicy::new());
        let err = engine.render("t", json!({})).unwrap_err();
        assert!(err.to_string().contains("owner"), "got {}", err);

        engine.set_sandbox_policy(SandboxPolicy::new().allow_attribute("owner"));
        assert_eq!(engine.render("t", json!({})).unwrap(), "ada");
    }
}
