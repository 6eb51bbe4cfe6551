//! Integration tests for block layout and change tracking.
//!
//! Layout properties are checked for both packing standards through `rstest`
//! cases; the packing tests read values back out of the block image at the
//! computed offsets.

use rstest::rstest;

use bindery_core::source::share;
use bindery_core::{
    Block, BufferValue, DataType, DeviceCapabilities, FieldDecl, PackingStandard,
    QuaternionValue, SharedSource, UniformValue, Value, compute_layout,
};

fn read_f32(data: &[u8], offset: usize) -> f32 {
    f32::from_ne_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}

// ============================================================================
// Layout Properties
// ============================================================================

fn mixed_fields() -> Vec<FieldDecl> {
    vec![
        FieldDecl::scalar(DataType::Float),
        FieldDecl::scalar(DataType::Vec3),
        FieldDecl::scalar(DataType::Vec2),
        FieldDecl::array(DataType::Float, 3),
        FieldDecl::scalar(DataType::Int),
        FieldDecl::array(DataType::Vec3, 2),
        FieldDecl::scalar(DataType::Mat4),
        FieldDecl::array(DataType::UVec2, 5),
        FieldDecl::scalar(DataType::UInt),
    ]
}

#[rstest]
#[case::std140(PackingStandard::Std140)]
#[case::std430(PackingStandard::Std430)]
fn test_fields_never_overlap(#[case] standard: PackingStandard) {
    let fields = mixed_fields();
    let layout = compute_layout(&fields, standard);

    for pair in layout.fields().windows(2) {
        assert!(pair[0].end() <= pair[1].offset);
    }
    for (decl, info) in fields.iter().zip(layout.fields()) {
        assert_eq!(info.offset % decl.align(standard), 0);
    }
    let last = layout.fields().last().unwrap();
    assert_eq!(layout.size(), last.end());
}

#[rstest]
#[case::std140(PackingStandard::Std140)]
#[case::std430(PackingStandard::Std430)]
fn test_layout_is_deterministic(#[case] standard: PackingStandard) {
    let fields = mixed_fields();
    assert_eq!(compute_layout(&fields, standard), compute_layout(&fields, standard));
}

#[rstest]
#[case::std140(PackingStandard::Std140)]
#[case::std430(PackingStandard::Std430)]
fn test_swapping_vec4_fields_keeps_offsets(#[case] standard: PackingStandard) {
    let layout = compute_layout(
        &[
            FieldDecl::scalar(DataType::Vec4),
            FieldDecl::scalar(DataType::IVec4),
        ],
        standard,
    );
    let swapped = compute_layout(
        &[
            FieldDecl::scalar(DataType::IVec4),
            FieldDecl::scalar(DataType::Vec4),
        ],
        standard,
    );
    assert_eq!(layout.fields(), swapped.fields());
    assert_eq!(layout.size(), 32);
}

#[rstest]
#[case::std140(PackingStandard::Std140)]
#[case::std430(PackingStandard::Std430)]
fn test_mixing_scalar_and_vector_is_order_sensitive(#[case] standard: PackingStandard) {
    let scalar_first = compute_layout(
        &[
            FieldDecl::scalar(DataType::Float),
            FieldDecl::scalar(DataType::Vec4),
        ],
        standard,
    );
    let vector_first = compute_layout(
        &[
            FieldDecl::scalar(DataType::Vec4),
            FieldDecl::scalar(DataType::Float),
        ],
        standard,
    );
    assert_eq!(scalar_first.fields()[1].offset, 16);
    assert_eq!(vector_first.fields()[1].offset, 16);
    assert_eq!(scalar_first.size(), 32);
    assert_eq!(vector_first.size(), 20);
}

#[rstest]
#[case::float(DataType::Float, 16, 4)]
#[case::vec2(DataType::Vec2, 16, 8)]
#[case::vec3(DataType::Vec3, 16, 16)]
#[case::ivec4(DataType::IVec4, 16, 16)]
#[case::mat4(DataType::Mat4, 64, 64)]
fn test_array_strides(
    #[case] data_type: DataType,
    #[case] std140_stride: u32,
    #[case] std430_stride: u32,
) {
    let fields = [FieldDecl::array(data_type, 3)];
    let std140 = compute_layout(&fields, PackingStandard::Std140);
    let std430 = compute_layout(&fields, PackingStandard::Std430);
    assert_eq!(std140.fields()[0].stride, std140_stride);
    assert_eq!(std140.size(), 3 * std140_stride);
    assert_eq!(std430.fields()[0].stride, std430_stride);
    assert_eq!(std430.size(), 3 * std430_stride);
}

// ============================================================================
// Packing
// ============================================================================

#[test]
fn test_float_vec3_mat4_block() {
    let mut matrix = [0.0f32; 16];
    matrix[0] = 5.0;
    matrix[15] = 6.0;

    let block = Block::new(
        "scenario",
        vec![
            share(UniformValue::new(Value::Float(1.0))),
            share(UniformValue::new(Value::Vec3([2.0, 3.0, 4.0]))),
            share(UniformValue::new(Value::Mat4(matrix))),
        ],
        PackingStandard::Std140,
        &DeviceCapabilities::default(),
    )
    .unwrap();

    let offsets: Vec<u32> = block.layout().fields().iter().map(|f| f.offset).collect();
    assert_eq!(offsets, vec![0, 16, 32]);
    assert_eq!(block.size(), 96);

    let data = block.data();
    assert_eq!(read_f32(data, 0), 1.0);
    assert_eq!(read_f32(data, 16), 2.0);
    assert_eq!(read_f32(data, 24), 4.0);
    assert_eq!(read_f32(data, 32), 5.0);
    assert_eq!(read_f32(data, 32 + 60), 6.0);
}

#[test]
fn test_vec3_array_expands_to_gpu_stride() {
    let points = [[1.0f32, 2.0, 3.0], [4.0, 5.0, 6.0], [7.0, 8.0, 9.0]];
    let source = share(BufferValue::from_slice(DataType::Vec3, &points).unwrap());
    let block = Block::new(
        "points",
        vec![source],
        PackingStandard::Std140,
        &DeviceCapabilities::default(),
    )
    .unwrap();

    let info = *block.field_info(0).unwrap();
    assert_eq!(info.stride, 16);
    assert_eq!(info.size, 48);

    let data = block.data();
    for (i, point) in points.iter().enumerate() {
        for (c, value) in point.iter().enumerate() {
            assert_eq!(read_f32(data, i * 16 + c * 4), *value);
        }
    }
}

#[test]
fn test_matching_stride_copies_verbatim() {
    let values = [[1.0f32, 2.0, 3.0, 4.0], [5.0, 6.0, 7.0, 8.0]];
    let source = share(BufferValue::from_slice(DataType::Vec4, &values).unwrap());
    let block = Block::new(
        "colors",
        vec![source],
        PackingStandard::Std430,
        &DeviceCapabilities::default(),
    )
    .unwrap();
    assert_eq!(block.data(), bytemuck::cast_slice::<[f32; 4], u8>(&values));
}

#[test]
fn test_refresh_only_after_mutation() {
    let value = std::sync::Arc::new(parking_lot::RwLock::new(UniformValue::new(Value::Float(1.0))));
    let shared: SharedSource = value.clone();
    let mut block = Block::new(
        "globals",
        vec![shared, share(UniformValue::new(Value::Vec2([0.0, 0.0])))],
        PackingStandard::Std140,
        &DeviceCapabilities::default(),
    )
    .unwrap();
    block.clear_dirty();
    assert!(!block.refresh(false));

    // Writing the same value is not a change
    value.write().set(Value::Float(1.0)).unwrap();
    assert!(!block.refresh(false));

    value.write().set(Value::Float(4.0)).unwrap();
    assert!(block.refresh(false));
    assert_eq!(read_f32(block.data(), 0), 4.0);
}

#[test]
fn test_animated_source_refreshes_on_update() {
    let animated = share(UniformValue::animated(Value::Float(0.0), |t| {
        Value::Float(t as f32)
    }));
    let mut block = Block::new(
        "live",
        vec![animated],
        PackingStandard::Std140,
        &DeviceCapabilities::default(),
    )
    .unwrap();
    block.clear_dirty();
    assert!(block.update(2.0));
    assert!(block.is_dirty());
    assert_eq!(read_f32(block.data(), 0), 2.0);
}

#[test]
fn test_buffer_mutation_round_trip() {
    let buffer = BufferValue::from_slice(DataType::Float, &[0.0f32, 0.0, 0.0]).unwrap();
    let source = std::sync::Arc::new(parking_lot::RwLock::new(buffer));
    let shared: SharedSource = source.clone();
    let mut block = Block::new(
        "weights",
        vec![shared],
        PackingStandard::Std140,
        &DeviceCapabilities::default(),
    )
    .unwrap();
    block.clear_dirty();

    source.write().set_element(2, &9.5f32).unwrap();
    assert!(block.refresh(false));
    assert_eq!(read_f32(block.data(), 32), 9.5);

    block.clear_dirty();
    assert!(!block.refresh(false));
    assert!(!block.is_dirty());
}

#[test]
fn test_quaternion_matrix_field() {
    let rotation = share(QuaternionValue::from_components([0.0, 0.0, 0.0, 1.0]).as_matrix());
    let block = Block::new(
        "rotation",
        vec![share(UniformValue::new(Value::Float(0.0))), rotation],
        PackingStandard::Std140,
        &DeviceCapabilities::default(),
    )
    .unwrap();
    assert_eq!(block.field_info(1).unwrap().offset, 16);
    assert_eq!(block.size(), 80);
    assert_eq!(read_f32(block.data(), 16), 1.0);
    assert_eq!(read_f32(block.data(), 16 + 20), 1.0);
}
