use briny_autograd::backprop::{fully_connected, matmul, relu, split, sum};
use briny_autograd::{mode, tensor, tensors::Tensor};

#[test]
fn test_tensor_creation() {
    let t = Tensor::new(vec![2, 2], vec![1.0, 2.0, 3.0, 4.0]);
    assert_eq!(t.shape(), &[2, 2]);
    assert_eq!(t.to_vec(), vec![1.0, 2.0, 3.0, 4.0]);
}

#[test]
fn test_tensor_macro() {
    let t = tensor!([[1.0, 2.0], [3.0, 4.0]]);
    assert_eq!(t.shape(), &[2, 2]);
    assert_eq!(t.to_vec(), vec![1.0, 2.0, 3.0, 4.0]);
}

#[test]
fn test_tensor_macro_rank_three() {
    let t = tensor!([[[1, 2], [3, 4]], [[5, 6], [7, 8]]]);
    assert_eq!(t.shape(), &[2, 2, 2]);
    assert_eq!(t.len(), 8);
}

#[test]
fn test_tensor_shape_mismatch_panics() {
    let result = std::panic::catch_unwind(|| {
        Tensor::new(vec![2, 2], vec![1.0, 2.0, 3.0]);
    });
    assert!(result.is_err());
}

#[test]
fn test_random_uniform_range() {
    let t = Tensor::random_uniform([1000], -1.0, 1.0);
    assert!(t.to_vec().iter().all(|v| (-1.0..1.0).contains(v)));
}

#[test]
fn test_matmul_backprop() {
    let a = Tensor::new(vec![2, 3], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    let b = Tensor::new(vec![3, 2], vec![7.0, 8.0, 9.0, 10.0, 11.0, 12.0]);
    a.attach_grad();
    b.attach_grad();

    let _rec = mode::record(None);
    let output = matmul(&a, &b);
    assert_eq!(output.shape(), &[2, 2]);
    output.backward().unwrap();
    let grad_a = a.grad().unwrap();
    let grad_b = b.grad().unwrap();
    assert_eq!(grad_a.shape(), &[2, 3]);
    assert_eq!(grad_b.shape(), &[3, 2]);
    assert_eq!(grad_a.to_vec(), vec![15.0, 19.0, 23.0, 15.0, 19.0, 23.0]);
    assert_eq!(grad_b.to_vec(), vec![5.0, 5.0, 7.0, 7.0, 9.0, 9.0]);
}

#[test]
fn test_relu_backprop() {
    let t = Tensor::new(vec![3], vec![-1.0, 0.0, 1.0]);
    t.attach_grad();
    let _rec = mode::record(None);
    let output = relu(&t);
    assert_eq!(output.to_vec(), vec![0.0, 0.0, 1.0]);
    output.backward().unwrap();
    assert_eq!(t.grad().unwrap().to_vec(), vec![0.0, 0.0, 1.0]);
}

#[test]
fn test_fully_connected_backprop() {
    let x = tensor!([[1.0, 2.0]]);
    let w = tensor!([[1.0, 0.0], [0.0, 1.0], [1.0, 1.0]]);
    let bias = tensor!([0.5, -0.5, 0.0]);
    for t in [&x, &w, &bias] {
        t.attach_grad();
    }
    let _rec = mode::record(None);
    let out = fully_connected(&x, &w, &bias);
    assert_eq!(out.to_vec(), vec![1.5, 1.5, 3.0]);
    sum(&out).backward().unwrap();
    assert_eq!(x.grad().unwrap().to_vec(), vec![2.0, 2.0]);
    assert_eq!(w.grad().unwrap().to_vec(), vec![1.0, 2.0, 1.0, 2.0, 1.0, 2.0]);
    assert_eq!(bias.grad().unwrap().to_vec(), vec![1.0, 1.0, 1.0]);
}

#[test]
fn test_split_without_squeeze() {
    let x = tensor!([[1, 2], [3, 4], [5, 6], [7, 8]]);
    let parts = split(&x, 2, false);
    assert_eq!(parts.len(), 2);
    assert_eq!(parts[0].shape(), &[2, 2]);
    assert_eq!(parts[1].to_vec(), vec![5.0, 6.0, 7.0, 8.0]);
}

#[test]
fn test_split_squeeze_drops_unit_axis() {
    let x = tensor!([[1, 2], [3, 4]]);
    let kept = split(&x, 2, false);
    assert_eq!(kept[0].shape(), &[1, 2]);
    let squeezed = split(&x, 2, true);
    assert_eq!(squeezed[0].shape(), &[2]);
    assert_eq!(squeezed[1].to_vec(), vec![3.0, 4.0]);
}

#[test]
fn test_sum_chain() {
    let x = tensor!([1.0, 2.0, 3.0]);
    x.attach_grad();
    let _rec = mode::record(None);
    let y = (&x * &x).sum();
    assert_eq!(y.to_vec(), vec![14.0]);
    y.backward().unwrap();
    assert_eq!(x.grad().unwrap().to_vec(), vec![2.0, 4.0, 6.0]);
}
